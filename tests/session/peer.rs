//! Scripted stand-in for the agent, connected over in-memory pipes.

use std::time::Duration;

use agent_session::session::EventStream;
use agent_session::{Session, SessionBuilder, SessionEvent};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, Lines,
};

const PIPE_CAPACITY: usize = 64 * 1024;
const WAIT: Duration = Duration::from_secs(5);

pub const SESSION_ID: &str = "sess-1";

pub struct FakePeer {
    lines: Lines<BufReader<DuplexStream>>,
    out: DuplexStream,
    /// Body of the initialize request the session opened with.
    pub init_request: Value,
}

impl FakePeer {
    fn new(reader: DuplexStream, out: DuplexStream) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            out,
            init_request: Value::Null,
        }
    }

    /// Next line written by the session.
    pub async fn recv(&mut self) -> Value {
        self.try_recv()
            .await
            .expect("session closed its output")
    }

    /// Next line, or `None` once the session closes its side.
    pub async fn try_recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for session output")
            .ok()??;
        Some(serde_json::from_str(&line).expect("session wrote invalid JSON"))
    }

    pub async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.out.write_all(line.as_bytes()).await.unwrap();
        self.out.write_all(b"\n").await.unwrap();
        self.out.flush().await.unwrap();
    }

    /// Wait for a control request and return its id and body.
    pub async fn expect_control_request(&mut self, subtype: &str) -> (String, Value) {
        let msg = self.recv().await;
        assert_eq!(msg["type"], "control_request", "unexpected message: {msg}");
        assert_eq!(msg["request"]["subtype"], subtype, "unexpected request: {msg}");
        let id = msg["request_id"].as_str().unwrap().to_string();
        (id, msg["request"].clone())
    }

    /// Wait for the session's answer to one of our control requests.
    pub async fn expect_control_response(&mut self) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["type"], "control_response", "unexpected message: {msg}");
        msg["response"].clone()
    }

    pub async fn expect_user_message(&mut self) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["type"], "user", "unexpected message: {msg}");
        msg
    }

    pub async fn respond_success(&mut self, request_id: &str, response: Value) {
        self.send(json!({
            "type": "control_response",
            "response": { "subtype": "success", "request_id": request_id, "response": response },
        }))
        .await;
    }

    pub async fn respond_error(&mut self, request_id: &str, error: &str) {
        self.send(json!({
            "type": "control_response",
            "response": { "subtype": "error", "request_id": request_id, "error": error },
        }))
        .await;
    }

    /// Issue a control request of our own to the session.
    pub async fn request(&mut self, request_id: &str, request: Value) {
        self.send(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        }))
        .await;
    }

    /// Tunnel a tool sub-protocol message to the session's tool server.
    pub async fn request_tool(&mut self, request_id: &str, server: &str, message: Value) {
        self.request(
            request_id,
            json!({ "subtype": "mcp_message", "server_name": server, "message": message }),
        )
        .await;
    }

    pub async fn send_init(&mut self) {
        self.send(json!({
            "type": "system",
            "subtype": "init",
            "session_id": SESSION_ID,
            "model": "test-model",
            "cwd": "/work",
            "tools": ["Read", "Bash"],
            "permissionMode": "default",
            "mcp_servers": [{ "name": "host", "status": "connected" }],
        }))
        .await;
    }

    pub async fn send_text_delta(&mut self, text: &str) {
        self.send(json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": text },
            },
        }))
        .await;
    }

    pub async fn send_assistant_text(&mut self, text: &str) {
        self.send(json!({
            "type": "assistant",
            "message": { "content": [{ "type": "text", "text": text }] },
            "session_id": SESSION_ID,
        }))
        .await;
    }

    pub async fn send_success(&mut self, cost_usd: f64) {
        self.send(json!({
            "type": "result",
            "subtype": "success",
            "session_id": SESSION_ID,
            "is_error": false,
            "duration_ms": 1200,
            "num_turns": 1,
            "result": "done",
            "total_cost_usd": cost_usd,
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        }))
        .await;
    }

    pub async fn send_error(&mut self, message: &str) {
        self.send(json!({
            "type": "result",
            "subtype": "error_during_execution",
            "session_id": SESSION_ID,
            "is_error": true,
            "result": message,
        }))
        .await;
    }
}

/// Start a session against a peer that completes the handshake.
pub async fn connect(builder: SessionBuilder) -> (Session, FakePeer) {
    connect_via(builder, |reader| reader).await
}

/// Like [`connect`], with the session reading through `wrap`.
pub async fn connect_via<R>(
    builder: SessionBuilder,
    wrap: impl FnOnce(DuplexStream) -> R,
) -> (Session, FakePeer)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (session_writer, peer_reader) = duplex(PIPE_CAPACITY);
    let (peer_writer, session_reader) = duplex(PIPE_CAPACITY);
    let mut peer = FakePeer::new(peer_reader, peer_writer);

    let handshake = tokio::spawn(async move {
        let (id, request) = peer.expect_control_request("initialize").await;
        peer.init_request = request;
        peer.send_init().await;
        peer.respond_success(&id, json!({ "commands": [] })).await;
        peer
    });

    let session = builder
        .connect(wrap(session_reader), session_writer)
        .await
        .expect("session should start");
    let peer = handshake.await.unwrap();
    (session, peer)
}

/// Connect without running the handshake.
pub fn raw_pipes() -> (DuplexStream, DuplexStream, FakePeer) {
    let (session_writer, peer_reader) = duplex(PIPE_CAPACITY);
    let (peer_writer, session_reader) = duplex(PIPE_CAPACITY);
    (
        session_reader,
        session_writer,
        FakePeer::new(peer_reader, peer_writer),
    )
}

pub async fn next_event(events: &mut EventStream) -> Option<SessionEvent> {
    tokio::time::timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for an event")
}

/// Skip events until one matches.
pub async fn wait_for(
    events: &mut EventStream,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(events).await.expect("event stream ended");
        if pred(&event) {
            return event;
        }
    }
}

/// Drain the stream until it closes.
pub async fn drain(events: &mut EventStream) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = next_event(events).await {
        seen.push(event);
    }
    seen
}
