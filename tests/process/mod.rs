//! Tests against real child processes.

#[cfg(unix)]
mod stop_test;

use agent_session::{ErrorCategory, Session, SessionConfig, SessionError};

#[tokio::test]
async fn missing_binary_is_a_process_error() {
    let config = SessionConfig {
        executable: "/nonexistent/agent-binary".to_string(),
        ..SessionConfig::default()
    };
    let err = Session::spawn(config).await.unwrap_err();
    match &err {
        SessionError::Spawn(spawn) => assert!(spawn.is_not_found()),
        other => panic!("expected a spawn error, got {other:?}"),
    }
    assert_eq!(err.category(), ErrorCategory::Process);
    assert!(!err.is_recoverable());
}
