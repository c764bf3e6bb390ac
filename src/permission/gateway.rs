//! Answers the agent's `can_use_tool` control requests.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};

use super::policy::{
    PermissionOption, PermissionOptionKind, PermissionOutcome, PermissionPolicy,
    PermissionRequest,
};

/// Wraps a [`PermissionPolicy`] and guarantees exactly one answer per request.
#[derive(Clone)]
pub struct PermissionGateway {
    policy: Arc<dyn PermissionPolicy>,
}

impl PermissionGateway {
    pub fn new(policy: Arc<dyn PermissionPolicy>) -> Self {
        Self { policy }
    }

    /// Options used when the agent offers none.
    #[must_use]
    pub fn default_options() -> Vec<PermissionOption> {
        vec![
            PermissionOption::new("allow", "Allow", PermissionOptionKind::AllowOnce),
            PermissionOption::new("deny", "Deny", PermissionOptionKind::RejectOnce),
        ]
    }

    /// Run the policy. A selection naming an option that was not offered, or
    /// a policy that panics, yields `Cancelled`.
    pub async fn decide(&self, request: &PermissionRequest) -> PermissionOutcome {
        let outcome = match AssertUnwindSafe(self.policy.decide(request))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(tool = ?request.tool_name, "Permission policy panicked");
                return PermissionOutcome::Cancelled;
            }
        };

        match outcome {
            PermissionOutcome::Selected(ref id)
                if !request.options.iter().any(|o| &o.option_id == id) =>
            {
                tracing::warn!(option_id = %id, "Policy selected an option that was not offered");
                PermissionOutcome::Cancelled
            }
            other => other,
        }
    }

    /// Build the `can_use_tool` response body.
    pub async fn answer_can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        tool_use_id: Option<String>,
        options: Vec<PermissionOption>,
    ) -> Value {
        let options = if options.is_empty() {
            Self::default_options()
        } else {
            options
        };
        let request = PermissionRequest {
            tool_name: Some(tool_name.to_string()),
            tool_call_id: tool_use_id,
            input,
            options,
        };

        let outcome = self.decide(&request).await;
        let allowed = match &outcome {
            PermissionOutcome::Selected(id) => request
                .options
                .iter()
                .any(|o| &o.option_id == id && o.kind.is_allow()),
            PermissionOutcome::Cancelled => false,
        };
        tracing::debug!(tool = %tool_name, ?outcome, allowed, "Permission decided");

        if allowed {
            json!({ "behavior": "allow", "updatedInput": request.input })
        } else {
            let message = match outcome {
                PermissionOutcome::Cancelled => "Permission request cancelled".to_string(),
                PermissionOutcome::Selected(_) => format!("Tool '{tool_name}' denied by policy"),
            };
            json!({ "behavior": "deny", "message": message })
        }
    }
}

impl std::fmt::Debug for PermissionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGateway").finish_non_exhaustive()
    }
}
