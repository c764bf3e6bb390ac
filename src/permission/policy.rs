//! Permission policies for tool authorization requests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an outcome option offered by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
    /// A kind this crate does not know; never treated as allowing.
    #[serde(other)]
    Other,
}

impl PermissionOptionKind {
    /// Whether selecting this option lets the tool run.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

/// One selectable outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOption {
    #[serde(alias = "optionId")]
    pub option_id: String,
    #[serde(default)]
    pub name: String,
    pub kind: PermissionOptionKind,
}

impl PermissionOption {
    #[must_use]
    pub fn new(
        option_id: impl Into<String>,
        name: impl Into<String>,
        kind: PermissionOptionKind,
    ) -> Self {
        Self {
            option_id: option_id.into(),
            name: name.into(),
            kind,
        }
    }
}

/// A tool authorization request.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub input: Value,
    pub options: Vec<PermissionOption>,
}

impl PermissionRequest {
    /// The tool name, recovered from the call id prefix when not supplied.
    ///
    /// Call ids look like `Read-01ab` or `Read:01ab`.
    #[must_use]
    pub fn resolved_tool_name(&self) -> Option<&str> {
        if let Some(name) = self.tool_name.as_deref().filter(|n| !n.is_empty()) {
            return Some(name);
        }
        let id = self.tool_call_id.as_deref()?;
        let prefix = id.split(['-', ':']).next().unwrap_or_default();
        (!prefix.is_empty() && prefix != id).then_some(prefix)
    }

    fn first_of(&self, allow: bool) -> Option<&PermissionOption> {
        self.options.iter().find(|o| o.kind.is_allow() == allow)
    }
}

/// Result of a permission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// The option with this id was chosen.
    Selected(String),
    Cancelled,
}

/// Decides tool authorization requests.
#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    async fn decide(&self, request: &PermissionRequest) -> PermissionOutcome;
}

/// Select the first allow option, else the first option, else cancel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowFirstPolicy;

#[async_trait]
impl PermissionPolicy for AllowFirstPolicy {
    async fn decide(&self, request: &PermissionRequest) -> PermissionOutcome {
        request
            .first_of(true)
            .or_else(|| request.options.first())
            .map_or(PermissionOutcome::Cancelled, |o| {
                PermissionOutcome::Selected(o.option_id.clone())
            })
    }
}

const READ_ONLY_TOOLS: &[&str] = &[
    "read",
    "glob",
    "grep",
    "ls",
    "notebookread",
    "todoread",
    "webfetch",
    "websearch",
    "read_text_file",
    "terminal_output",
    "terminal_wait_for_exit",
];

const WRITE_TOOLS: &[&str] = &[
    "write",
    "edit",
    "multiedit",
    "notebookedit",
    "bash",
    "killshell",
    "todowrite",
    "write_text_file",
    "terminal_create",
    "terminal_kill",
    "terminal_release",
];

/// Allow read-only tools and reject everything else.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyPolicy {
    extra_read_only: Vec<String>,
}

impl ReadOnlyPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat another tool name as read-only.
    #[must_use]
    pub fn with_read_only(mut self, tool: impl Into<String>) -> Self {
        self.extra_read_only.push(tool.into().to_lowercase());
        self
    }

    /// Whether `tool` is allowed under this policy.
    #[must_use]
    pub fn is_read_only(&self, tool: &str) -> bool {
        // MCP tools arrive as mcp__<server>__<tool>.
        let name = tool.rsplit("__").next().unwrap_or(tool).to_lowercase();
        if WRITE_TOOLS.contains(&name.as_str()) {
            return false;
        }
        READ_ONLY_TOOLS.contains(&name.as_str()) || self.extra_read_only.contains(&name)
    }
}

#[async_trait]
impl PermissionPolicy for ReadOnlyPolicy {
    async fn decide(&self, request: &PermissionRequest) -> PermissionOutcome {
        let allow = request
            .resolved_tool_name()
            .is_some_and(|name| self.is_read_only(name));
        tracing::debug!(
            tool = ?request.resolved_tool_name(),
            allow,
            "Read-only policy decision"
        );
        request
            .first_of(allow)
            .map_or(PermissionOutcome::Cancelled, |o| {
                PermissionOutcome::Selected(o.option_id.clone())
            })
    }
}

type DecideFn = dyn Fn(&PermissionRequest) -> PermissionOutcome + Send + Sync;

/// Delegate decisions to a caller-supplied closure.
#[derive(Clone)]
pub struct CallbackPolicy {
    callback: Arc<DecideFn>,
}

impl CallbackPolicy {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&PermissionRequest) -> PermissionOutcome + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl std::fmt::Debug for CallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPolicy").finish_non_exhaustive()
    }
}

#[async_trait]
impl PermissionPolicy for CallbackPolicy {
    async fn decide(&self, request: &PermissionRequest) -> PermissionOutcome {
        (self.callback)(request)
    }
}
