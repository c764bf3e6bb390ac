//! Crate-level error type.

use crate::cli::{SpawnError, StreamError};
use crate::config::ConfigError;
use crate::control::ControlError;
use crate::session::StateError;
use crate::turn::TurnError;
use crate::wire::WireError;

/// Broad classes of failure, for callers that branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The agent could not be started.
    Process,
    /// Bad data on the wire or a failed control exchange.
    Protocol,
    /// The agent reported a failed turn.
    Turn,
    /// The operation is not legal in the current state.
    State,
    /// A soft limit failed the turn.
    Guardrail,
    Closed,
    NotStarted,
    Config,
}

/// Error type for session operations.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Control(ControlError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Turn {number} failed: {error}")]
    TurnFailed { number: u64, error: TurnError },
    #[error("Session is closed")]
    Closed,
    #[error("Session has not started")]
    NotStarted,
    #[error("Refusing to send empty input")]
    EmptyInput,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ControlError> for SessionError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::SessionStopped => Self::Closed,
            other => Self::Control(other),
        }
    }
}

impl SessionError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Spawn(_) => ErrorCategory::Process,
            Self::Stream(_) | Self::Wire(_) | Self::Control(_) => ErrorCategory::Protocol,
            Self::State(_) | Self::EmptyInput => ErrorCategory::State,
            Self::TurnFailed { error, .. } => match error {
                TurnError::Guardrail(_) => ErrorCategory::Guardrail,
                TurnError::SessionClosed => ErrorCategory::Closed,
                TurnError::Peer { .. } | TurnError::Abandoned { .. } => ErrorCategory::Turn,
            },
            Self::Closed => ErrorCategory::Closed,
            Self::NotStarted => ErrorCategory::NotStarted,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Whether the session can keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Protocol
                | ErrorCategory::Turn
                | ErrorCategory::State
                | ErrorCategory::Guardrail
        )
    }
}
