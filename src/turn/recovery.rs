//! Reclassification of peer errors that followed real work.
//!
//! Some agents end an otherwise productive turn with an error saying the
//! final response was empty. The wording is specific to one agent build, so
//! the match lives behind [`RecoveryPolicy`] and is configurable.

use super::result::TurnError;

/// What a turn produced before its result arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnActivity {
    pub has_text: bool,
    pub has_thinking: bool,
    pub has_tool_activity: bool,
}

impl TurnActivity {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.has_text || self.has_thinking || self.has_tool_activity)
    }
}

/// Decides whether a peer-reported turn error should count as success.
pub trait RecoveryPolicy: Send + Sync + std::fmt::Debug {
    fn is_recoverable(&self, error: &TurnError, activity: &TurnActivity) -> bool;
}

/// Recover errors carrying `code` whose message contains `pattern`, when the
/// turn streamed anything at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyResponseRecovery {
    code: u16,
    pattern: String,
}

impl EmptyResponseRecovery {
    pub const DEFAULT_CODE: u16 = 500;
    pub const DEFAULT_PATTERN: &'static str = "empty response text";

    #[must_use]
    pub fn new(code: u16, pattern: impl Into<String>) -> Self {
        Self {
            code,
            pattern: pattern.into().to_lowercase(),
        }
    }
}

impl Default for EmptyResponseRecovery {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CODE, Self::DEFAULT_PATTERN)
    }
}

impl RecoveryPolicy for EmptyResponseRecovery {
    fn is_recoverable(&self, error: &TurnError, activity: &TurnActivity) -> bool {
        let TurnError::Peer {
            code: Some(code),
            message,
            ..
        } = error
        else {
            return false;
        };
        *code == self.code
            && message.to_lowercase().contains(&self.pattern)
            && !activity.is_empty()
    }
}

/// Never reclassify.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRecover;

impl RecoveryPolicy for NeverRecover {
    fn is_recoverable(&self, _error: &TurnError, _activity: &TurnActivity) -> bool {
        false
    }
}
