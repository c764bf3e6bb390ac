//! Background read loop and inbound dispatch.
//!
//! Dispatch itself never waits on I/O: replies to agent requests are
//! written from spawned tasks, so a slow tool handler cannot stall
//! delivery of later messages.

use std::future::Future;
use std::sync::{Arc, Weak};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::client::{Inner, ShutdownCause};
use super::events::{ErrorContext, SessionEvent};
use super::state::SessionState;
use crate::cli::PeerReader;
use crate::host::RecordEntry;
use crate::turn::{TurnAccumulator, TurnUpdate};
use crate::wire::{
    parse_message, ControlRequest, ControlRequestBody, Message, OutboundMessage, ResultMessage,
};

pub(super) async fn run(session: Weak<Inner>, done: CancellationToken, mut reader: PeerReader) {
    let mut cause = None;
    loop {
        let line = tokio::select! {
            biased;
            () = done.cancelled() => break,
            line = reader.read_line() => line,
        };
        let Some(inner) = session.upgrade() else {
            break;
        };
        match line {
            Ok(Some(line)) => handle_line(&inner, &line),
            Ok(None) => {
                tracing::info!("Agent closed its output");
                cause = Some(ShutdownCause::PeerClosed);
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "Skipping unreadable line from agent");
                inner.core().state.record_protocol_error();
                inner.emit(SessionEvent::error(&e, ErrorContext::Parse));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read from agent");
                inner.emit(SessionEvent::error(&e, ErrorContext::Read));
                cause = Some(ShutdownCause::ReadFailed);
                break;
            }
        }
    }

    if let Some(cause) = cause {
        if !done.is_cancelled() {
            if let Some(inner) = session.upgrade() {
                inner.shutdown(cause).await;
            }
        }
    }
    tracing::debug!("Reader task finished");
}

fn handle_line(inner: &Arc<Inner>, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    inner.record(RecordEntry::Received(line.to_string()));
    match parse_message(line) {
        Ok(message) => dispatch(inner, message),
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable message from agent");
            inner.core().state.record_protocol_error();
            inner.emit(SessionEvent::error(&e, ErrorContext::Parse));
        }
    }
}

fn dispatch(inner: &Arc<Inner>, message: Message) {
    match message {
        Message::SystemInit(init) => {
            tracing::info!(
                session_id = %init.session_id,
                model = %init.model,
                tools = init.tools.len(),
                "Agent session initialized"
            );
            inner.update_metadata(|m| m.apply_init(&init));
        }
        Message::Assistant(msg) => apply(inner, |turns| turns.apply_assistant(&msg)),
        Message::User(msg) => apply(inner, |turns| turns.apply_user(&msg)),
        Message::StreamEvent(event) => apply(inner, |turns| turns.apply_stream_event(&event)),
        Message::Result(result) => complete_turn(inner, &result),
        Message::ControlResponse(response) => {
            inner.control.deliver(&response.request_id, response.outcome);
        }
        Message::ControlRequest(request) => handle_control_request(inner, request),
        Message::MalformedControlRequest { request_id, reason } => {
            tracing::warn!(request_id = %request_id, reason = %reason, "Malformed control request");
            inner.core().state.record_protocol_error();
            reply_error(inner, request_id, format!("Malformed control request: {reason}"));
        }
        Message::ControlCancel { request_id } => {
            if inner.cancel_inflight(&request_id) {
                tracing::debug!(request_id = %request_id, "Agent cancelled request");
            } else {
                tracing::debug!(request_id = %request_id, "Cancel for a request no longer in flight");
            }
        }
        Message::Unknown(kind) => tracing::debug!(kind = %kind, "Ignoring message"),
    }
}

/// Fold content into the turn in flight and publish what changed.
fn apply(inner: &Inner, f: impl FnOnce(&mut TurnAccumulator) -> Vec<TurnUpdate>) {
    let (turn, updates) = {
        let mut core = inner.core();
        let Some(turn) = core.turns.current().map(|t| t.number) else {
            tracing::debug!("Content outside a turn, ignoring");
            return;
        };
        (turn, f(&mut core.turns))
    };
    for update in updates {
        inner.emit(SessionEvent::from_update(turn, update));
    }
}

fn complete_turn(inner: &Inner, result: &ResultMessage) {
    if !result.session_id.is_empty() {
        inner.update_metadata(|m| m.session_id = Some(result.session_id.clone()));
    }
    let outcome = {
        let mut core = inner.core();
        let outcome = core
            .turns
            .complete(result, inner.recovery.as_ref(), &inner.guardrails);
        if let Some(ref r) = outcome {
            core.state.record_turn_finished(r.success);
            if let Err(e) = core.state.transition(SessionState::Ready) {
                tracing::debug!(error = %e, "Turn finished outside processing");
            }
        }
        outcome
    };
    match outcome {
        Some(r) => {
            tracing::info!(
                turn = r.number,
                success = r.success,
                recovered = r.recovered,
                cost_usd = r.cost_usd,
                "Turn complete"
            );
            inner.finish_turn(&r);
        }
        None => tracing::debug!(subtype = %result.subtype, "Result with no turn in flight"),
    }
}

fn handle_control_request(inner: &Arc<Inner>, request: ControlRequest) {
    let ControlRequest {
        request_id,
        request,
    } = request;
    match request {
        ControlRequestBody::McpMessage {
            server_name,
            message,
        } => {
            let reply = inner.router.handle(&server_name, &message);
            if reply.is_pending() {
                inner.core().state.record_tool_call();
            }
            let task_inner = Arc::clone(inner);
            let id = request_id.clone();
            spawn_inflight(inner, request_id, async move {
                let response = reply.resolve().await;
                task_inner
                    .reply(OutboundMessage::control_success(
                        id,
                        json!({ "mcp_response": response }),
                    ))
                    .await;
            });
        }
        ControlRequestBody::CanUseTool {
            tool_name,
            input,
            tool_use_id,
            options,
            ..
        } => {
            inner.core().state.record_permission_request();
            tracing::debug!(tool = %tool_name, "Permission request");
            let task_inner = Arc::clone(inner);
            let id = request_id.clone();
            spawn_inflight(inner, request_id, async move {
                let response = task_inner
                    .gateway
                    .answer_can_use_tool(&tool_name, input, tool_use_id, options)
                    .await;
                task_inner
                    .reply(OutboundMessage::control_success(id, response))
                    .await;
            });
        }
        ControlRequestBody::Initialize { .. } => {
            let task_inner = Arc::clone(inner);
            let id = request_id.clone();
            spawn_inflight(inner, request_id, async move {
                task_inner
                    .reply(OutboundMessage::control_success(id, json!({})))
                    .await;
            });
        }
        ControlRequestBody::Interrupt
        | ControlRequestBody::SetPermissionMode { .. }
        | ControlRequestBody::SetModel { .. }
        | ControlRequestBody::Unknown => {
            tracing::warn!(request_id = %request_id, "Unsupported control request from agent");
            reply_error(inner, request_id, "Unsupported control request".to_string());
        }
    }
}

fn reply_error(inner: &Arc<Inner>, request_id: String, message: String) {
    let task_inner = Arc::clone(inner);
    let id = request_id.clone();
    spawn_inflight(inner, request_id, async move {
        task_inner
            .reply(OutboundMessage::control_error(id, message))
            .await;
    });
}

/// Run `fut` as the handler for `request_id`, abortable until it finishes.
fn spawn_inflight<F>(inner: &Arc<Inner>, request_id: String, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(inner);
    let key = request_id.clone();
    // Hold the table lock across spawn so the task cannot remove its entry
    // before it is inserted.
    let mut inflight = inner.inflight();
    let handle = inner.tasks.spawn(async move {
        fut.await;
        if let Some(inner) = weak.upgrade() {
            inner.inflight().remove(&key);
        }
    });
    if let Some(previous) = inflight.insert(request_id, handle.abort_handle()) {
        tracing::debug!("Duplicate request id from agent, replacing handler");
        previous.abort();
    }
}
