//! Session state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Uninitialized,
    /// Process spawned, initialize handshake in progress.
    Starting,
    Ready,
    /// A turn is in flight.
    Processing,
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use SessionState::{Closed, Processing, Ready, Starting, Uninitialized};
        matches!(
            (self, to),
            (Uninitialized, Starting)
                | (Starting, Ready)
                | (Ready, Processing)
                | (Processing, Ready)
                | (Uninitialized | Starting | Ready | Processing, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Error type for lifecycle violations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
    #[error("Turn {turn} is still in flight")]
    TurnInFlight { turn: u64 },
}

/// State machine for tracking session progress.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    stats: SessionStats,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            stats: SessionStats::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `new_state`, rejecting illegal transitions without effect.
    ///
    /// # Errors
    ///
    /// Returns `StateError::IllegalTransition` if the move is not allowed.
    pub fn transition(&mut self, new_state: SessionState) -> Result<(), StateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(StateError::IllegalTransition {
                from: self.state,
                to: new_state,
            });
        }
        tracing::debug!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
        Ok(())
    }

    /// Move to `Closed`. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        self.transition(SessionState::Closed).is_ok()
    }

    pub fn record_turn_started(&mut self) {
        self.stats.turns_started = self.stats.turns_started.saturating_add(1);
    }

    pub fn record_turn_finished(&mut self, success: bool) {
        if success {
            self.stats.turns_succeeded = self.stats.turns_succeeded.saturating_add(1);
        } else {
            self.stats.turns_failed = self.stats.turns_failed.saturating_add(1);
        }
    }

    pub fn record_tool_call(&mut self) {
        self.stats.tool_calls = self.stats.tool_calls.saturating_add(1);
    }

    pub fn record_permission_request(&mut self) {
        self.stats.permission_requests = self.stats.permission_requests.saturating_add(1);
    }

    pub fn record_protocol_error(&mut self) {
        self.stats.protocol_errors = self.stats.protocol_errors.saturating_add(1);
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

/// Session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub turns_started: usize,
    pub turns_succeeded: usize,
    pub turns_failed: usize,
    pub tool_calls: usize,
    pub permission_requests: usize,
    pub protocol_errors: usize,
}
