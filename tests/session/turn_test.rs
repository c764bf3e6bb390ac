//! Turn submission, accumulation and completion.

use agent_session::config::GuardrailConfig;
use agent_session::session::StateError;
use agent_session::turn::{GuardrailViolation, ToolStatus};
use agent_session::{
    ErrorCategory, SessionBuilder, SessionConfig, SessionError, SessionEvent, SessionState,
    TurnError,
};
use serde_json::json;

use super::peer::{connect, next_event, wait_for, SESSION_ID};

#[tokio::test]
async fn turn_streams_deltas_and_completes() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    let mut events = session.take_events().unwrap();
    assert!(session.take_events().is_none());

    match next_event(&mut events).await {
        Some(SessionEvent::Ready { session_id }) => {
            assert_eq!(session_id.as_deref(), Some(SESSION_ID));
        }
        other => panic!("expected Ready, got {other:?}"),
    }

    let sender = session.clone();
    let turn = tokio::spawn(async move { sender.send("hello").await });

    let user = peer.expect_user_message().await;
    assert_eq!(user["message"]["role"], "user");
    assert_eq!(user["message"]["content"], "hello");
    assert_eq!(user["session_id"], SESSION_ID);

    peer.send_text_delta("Hel").await;
    peer.send_text_delta("lo").await;
    peer.send_assistant_text("Hello").await;
    peer.send_success(0.25).await;

    let result = turn.await.unwrap().unwrap();
    assert_eq!(result.number, 1);
    assert!(result.success);
    assert!(!result.recovered);
    assert_eq!(result.text, "Hello");
    assert_eq!(result.usage.output_tokens, 5);
    assert_eq!(result.result_text.as_deref(), Some("done"));
    assert!((result.cost_usd - 0.25).abs() < f64::EPSILON);

    assert_eq!(
        next_event(&mut events).await,
        Some(SessionEvent::TextDelta {
            turn: 1,
            delta: "Hel".to_string(),
            accumulated: "Hel".to_string(),
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        Some(SessionEvent::TextDelta {
            turn: 1,
            delta: "lo".to_string(),
            accumulated: "Hello".to_string(),
        })
    );
    match next_event(&mut events).await {
        Some(SessionEvent::TurnComplete {
            number,
            success,
            error,
            ..
        }) => {
            assert_eq!(number, 1);
            assert!(success);
            assert!(error.is_none());
        }
        other => panic!("expected TurnComplete, got {other:?}"),
    }

    assert_eq!(session.state(), SessionState::Ready);
    assert!((session.total_cost_usd() - 0.25).abs() < f64::EPSILON);
    assert_eq!(session.stats().turns_succeeded, 1);
    assert_eq!(session.metadata().model.as_deref(), Some("test-model"));
    session.stop().await;
}

#[tokio::test]
async fn second_submit_while_processing_is_rejected() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    let mut events = session.take_events().unwrap();

    assert_eq!(session.submit("one").await.unwrap(), 1);
    assert_eq!(session.state(), SessionState::Processing);
    let err = session.submit("two").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::State(StateError::TurnInFlight { turn: 1 })
    ));
    assert_eq!(err.category(), ErrorCategory::State);
    assert_eq!(session.current_turn().map(|t| t.number), Some(1));

    peer.expect_user_message().await;
    peer.send_success(0.1).await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::TurnComplete { .. })).await;

    assert_eq!(session.submit("two").await.unwrap(), 2);
    session.stop().await;
}

#[tokio::test]
async fn empty_input_is_rejected() {
    let (session, _peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    assert!(matches!(
        session.submit("   ").await,
        Err(SessionError::EmptyInput)
    ));
    assert!(matches!(
        session.submit(Vec::<serde_json::Value>::new()).await,
        Err(SessionError::EmptyInput)
    ));
    assert_eq!(session.state(), SessionState::Ready);
    session.stop().await;
}

#[tokio::test]
async fn structured_input_is_sent_verbatim() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    let blocks = vec![json!({ "type": "text", "text": "look at this" })];
    session.submit(blocks).await.unwrap();

    let user = peer.expect_user_message().await;
    assert_eq!(user["message"]["content"][0]["text"], "look at this");
    session.stop().await;
}

#[tokio::test]
async fn peer_error_fails_turn() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;

    let sender = session.clone();
    let turn = tokio::spawn(async move { sender.send("go").await });
    peer.expect_user_message().await;
    peer.send_error("API Error: 529 overloaded").await;

    match turn.await.unwrap() {
        Err(SessionError::TurnFailed {
            number: 1,
            error: TurnError::Peer { code, .. },
        }) => assert_eq!(code, Some(529)),
        other => panic!("expected a failed turn, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.stats().turns_failed, 1);
    session.stop().await;
}

#[tokio::test]
async fn empty_response_error_after_text_is_recovered() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;

    let sender = session.clone();
    let turn = tokio::spawn(async move { sender.send("go").await });
    peer.expect_user_message().await;
    peer.send_text_delta("partial answer").await;
    peer.send_error("API Error: 500 empty response text").await;

    let result = turn.await.unwrap().unwrap();
    assert!(result.success);
    assert!(result.recovered);
    assert_eq!(result.text, "partial answer");
    session.stop().await;
}

#[tokio::test]
async fn empty_response_error_without_activity_fails() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;

    let sender = session.clone();
    let turn = tokio::spawn(async move { sender.send("go").await });
    peer.expect_user_message().await;
    peer.send_error("API Error: 500 empty response text").await;

    assert!(matches!(
        turn.await.unwrap(),
        Err(SessionError::TurnFailed { .. })
    ));
    session.stop().await;
}

#[tokio::test]
async fn budget_guardrail_fails_successful_turn() {
    let config = SessionConfig {
        guardrails: GuardrailConfig {
            max_turns: None,
            max_budget_usd: Some(0.1),
        },
        ..SessionConfig::default()
    };
    let (session, mut peer) = connect(SessionBuilder::new(config)).await;

    let sender = session.clone();
    let turn = tokio::spawn(async move { sender.send("go").await });
    peer.expect_user_message().await;
    peer.send_success(0.5).await;

    let err = turn.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::TurnFailed {
            error: TurnError::Guardrail(GuardrailViolation::Budget { .. }),
            ..
        }
    ));
    assert_eq!(err.category(), ErrorCategory::Guardrail);
    assert_eq!(session.state(), SessionState::Ready);
    assert!((session.total_cost_usd() - 0.5).abs() < f64::EPSILON);
    session.stop().await;
}

#[tokio::test]
async fn max_turns_guardrail_trips_on_next_turn() {
    let config = SessionConfig {
        guardrails: GuardrailConfig {
            max_turns: Some(1),
            max_budget_usd: None,
        },
        ..SessionConfig::default()
    };
    let (session, mut peer) = connect(SessionBuilder::new(config)).await;

    for expect_ok in [true, false] {
        let sender = session.clone();
        let turn = tokio::spawn(async move { sender.send("go").await });
        peer.expect_user_message().await;
        peer.send_success(0.0).await;
        assert_eq!(turn.await.unwrap().is_ok(), expect_ok);
    }
    session.stop().await;
}

#[tokio::test]
async fn tool_activity_is_tracked_in_order() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    let mut events = session.take_events().unwrap();

    let sender = session.clone();
    let turn = tokio::spawn(async move { sender.send("list files").await });
    peer.expect_user_message().await;
    peer.send(json!({
        "type": "assistant",
        "message": { "content": [
            { "type": "tool_use", "id": "toolu_1", "name": "Bash", "input": { "command": "ls" } },
        ] },
    }))
    .await;
    peer.send(json!({
        "type": "user",
        "message": { "content": [
            { "type": "tool_result", "tool_use_id": "toolu_1", "content": "a.txt" },
        ] },
    }))
    .await;
    peer.send_success(0.0).await;

    let result = turn.await.unwrap().unwrap();
    assert_eq!(result.tools.len(), 1);
    assert_eq!(result.tools[0].name, "Bash");
    assert_eq!(result.tools[0].status, ToolStatus::Completed);

    match wait_for(&mut events, |e| matches!(e, SessionEvent::ToolStart { .. })).await {
        SessionEvent::ToolStart { turn, id, name, .. } => {
            assert_eq!((turn, id.as_str(), name.as_str()), (1, "toolu_1", "Bash"));
        }
        _ => unreachable!(),
    }
    match wait_for(&mut events, |e| matches!(e, SessionEvent::ToolUpdate { .. })).await {
        SessionEvent::ToolUpdate { status, .. } => assert_eq!(status, ToolStatus::Completed),
        _ => unreachable!(),
    }
    session.stop().await;
}

#[tokio::test]
async fn recover_abandons_stuck_turn() {
    let (session, mut peer) = connect(SessionBuilder::new(SessionConfig::default())).await;
    let mut events = session.take_events().unwrap();

    assert!(session.recover().unwrap().is_none());

    session.submit("hang").await.unwrap();
    peer.expect_user_message().await;
    let abandoned = session.recover().unwrap().unwrap();
    assert_eq!(abandoned.number, 1);
    assert!(!abandoned.success);
    assert!(matches!(abandoned.error, Some(TurnError::Abandoned { .. })));
    assert_eq!(session.state(), SessionState::Ready);

    match wait_for(&mut events, |e| matches!(e, SessionEvent::TurnComplete { .. })).await {
        SessionEvent::TurnComplete { number, success, .. } => {
            assert_eq!(number, 1);
            assert!(!success);
        }
        _ => unreachable!(),
    }

    assert_eq!(session.submit("again").await.unwrap(), 2);
    session.stop().await;
}
