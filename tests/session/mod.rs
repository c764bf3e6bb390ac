//! Session tests against a scripted in-memory peer.

mod peer;
mod tools_test;
mod turn_test;

/// Verify the main public types are exported from the crate root.
#[test]
fn test_public_types_exported() {
    use agent_session::{
        ErrorCategory, Session, SessionBuilder, SessionConfig, SessionError, SessionEvent,
        SessionState, ToolEntry, ToolOutput, TurnError, UserInput,
    };

    let _ = SessionBuilder::new(SessionConfig::default());
    let _: fn() -> SessionError = || SessionError::Closed;
    let _ = SessionState::Uninitialized;
    let _ = ErrorCategory::Process;
    let _ = ToolOutput::text("ok");
    let _ = UserInput::from("hi");
    let _ = TurnError::SessionClosed;
    let _: Option<Session> = None;
    let _: Option<SessionEvent> = None;
    let _: Option<ToolEntry> = None;
}
