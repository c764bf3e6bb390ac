//! Turn outcomes and turn-level errors.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::accumulator::{ContentBlock, ToolRegistration};
use super::guardrail::GuardrailViolation;
use crate::wire::{ResultMessage, Usage};

/// Why a turn did not succeed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TurnError {
    /// The agent reported a failure in its result message.
    #[error("Agent reported {subtype}: {message}")]
    Peer {
        /// HTTP-style code parsed from `API Error: <code>`, when present.
        code: Option<u16>,
        subtype: String,
        message: String,
    },
    /// A soft limit was crossed; the session stays usable.
    #[error(transparent)]
    Guardrail(#[from] GuardrailViolation),
    /// The turn was ended locally without a result.
    #[error("Turn abandoned: {reason}")]
    Abandoned { reason: String },
    /// The session stopped while the turn was in flight.
    #[error("Session closed during turn")]
    SessionClosed,
}

impl TurnError {
    /// The peer error carried by `result`, if it reports one.
    #[must_use]
    pub fn from_result(result: &ResultMessage) -> Option<Self> {
        if !result.is_error && !result.subtype.starts_with("error") {
            return None;
        }
        let message = result
            .result
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| result.subtype.clone());
        Some(Self::Peer {
            code: api_error_code(&message),
            subtype: result.subtype.clone(),
            message,
        })
    }
}

fn api_error_code(text: &str) -> Option<u16> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| Regex::new(r"API Error:\s*(\d{3})\b").ok())
        .as_ref()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Structured outcome of one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub number: u64,
    pub success: bool,
    pub duration: Duration,
    pub usage: Usage,
    pub cost_usd: f64,
    pub text: String,
    pub thinking: String,
    pub blocks: Vec<ContentBlock>,
    pub tools: Vec<ToolRegistration>,
    /// Set whenever `success` is false.
    pub error: Option<TurnError>,
    /// A peer error was reclassified as success by the recovery policy.
    pub recovered: bool,
    /// Final free text reported by the agent.
    pub result_text: Option<String>,
}
