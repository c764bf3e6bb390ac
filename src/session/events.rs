//! Typed session events and their lossy delivery queue.
//!
//! The emitter never blocks: when the queue is full the newest event is
//! dropped and counted. Consumers must treat the stream as lossy under
//! backpressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::turn::{ToolStatus, TurnError, TurnResult, TurnUpdate};
use crate::wire::Usage;

/// Where an error event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    /// An inbound line could not be decoded.
    Parse,
    /// Reading the agent's output failed or ended.
    Read,
    /// A reply to the agent could not be written.
    Write,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parse => "parse",
            Self::Read => "read",
            Self::Write => "write",
        };
        f.write_str(s)
    }
}

/// An event observed by session consumers. Values are snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The initialize handshake completed.
    Ready { session_id: Option<String> },
    TextDelta {
        turn: u64,
        delta: String,
        accumulated: String,
    },
    ThinkingDelta {
        turn: u64,
        delta: String,
        accumulated: String,
    },
    ToolStart {
        turn: u64,
        id: String,
        name: String,
        input: Value,
    },
    ToolUpdate {
        turn: u64,
        id: String,
        name: String,
        status: ToolStatus,
        input: Value,
    },
    TurnComplete {
        number: u64,
        success: bool,
        duration: Duration,
        usage: Usage,
        cost_usd: f64,
        error: Option<TurnError>,
    },
    Error { cause: String, context: ErrorContext },
}

impl SessionEvent {
    pub(crate) fn from_update(turn: u64, update: TurnUpdate) -> Self {
        match update {
            TurnUpdate::TextDelta { delta, accumulated } => Self::TextDelta {
                turn,
                delta,
                accumulated,
            },
            TurnUpdate::ThinkingDelta { delta, accumulated } => Self::ThinkingDelta {
                turn,
                delta,
                accumulated,
            },
            TurnUpdate::ToolStart(reg) => Self::ToolStart {
                turn,
                id: reg.id,
                name: reg.name,
                input: reg.input,
            },
            TurnUpdate::ToolUpdate(reg) => Self::ToolUpdate {
                turn,
                id: reg.id,
                name: reg.name,
                status: reg.status,
                input: reg.input,
            },
        }
    }

    pub(crate) fn turn_complete(result: &TurnResult) -> Self {
        Self::TurnComplete {
            number: result.number,
            success: result.success,
            duration: result.duration,
            usage: result.usage,
            cost_usd: result.cost_usd,
            error: result.error.clone(),
        }
    }

    pub(crate) fn error(cause: impl std::fmt::Display, context: ErrorContext) -> Self {
        Self::Error {
            cause: cause.to_string(),
            context,
        }
    }
}

/// Ordered, read-only stream of session events.
pub type EventStream = ReceiverStream<SessionEvent>;

/// Bounded, non-blocking event queue that closes exactly once.
#[derive(Debug)]
pub struct EventEmitter {
    tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    dropped: AtomicU64,
}

impl EventEmitter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Hand out the consumer side. Only the first call gets it.
    pub fn take_stream(&self) -> Option<EventStream> {
        self.rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .map(ReceiverStream::new)
    }

    /// Queue `event` without waiting. Returns true if it was queued.
    pub fn emit(&self, event: SessionEvent) -> bool {
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped = total, ?event, "Event queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close the queue. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        let closed = self
            .tx
            .lock()
            .map(|mut tx| tx.take().is_some())
            .unwrap_or(false);
        if closed {
            tracing::debug!("Event stream closed");
        }
        closed
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }

    /// Events discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
