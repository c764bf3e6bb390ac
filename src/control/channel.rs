//! Request/response correlation for control messages.
//!
//! Each outgoing request gets a fresh id and a one-slot mailbox in the
//! pending table. The reader task hands responses to [`ControlChannel::deliver`],
//! which never blocks. The table has its own lock and it is never held across
//! an await, so a caller blocked in [`ControlChannel::send_and_wait`] cannot
//! stall the reader while the agent runs its nested handshake requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cli::{PeerWriter, StreamError};
use crate::wire::{ControlOutcome, OutboundControlRequest, OutboundMessage};

/// Default timeout for control requests.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for control requests.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    /// No response arrived before the deadline.
    #[error("Control request {request_id} timed out after {}ms", timeout.as_millis())]
    Timeout {
        request_id: String,
        timeout: Duration,
    },
    /// The session stopped while waiting.
    #[error("Session stopped before control response")]
    SessionStopped,
    /// The agent answered with an error.
    #[error("Control request {request_id} rejected: {message}")]
    Rejected { request_id: String, message: String },
    /// The request could not be written.
    #[error("Failed to send control request: {0}")]
    Write(#[from] StreamError),
}

type Mailbox = oneshot::Sender<ControlOutcome>;

/// Correlates outgoing control requests with incoming responses.
#[derive(Debug)]
pub struct ControlChannel {
    pending: Mutex<HashMap<String, Mailbox>>,
    counter: AtomicU64,
    nonce: String,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    #[must_use]
    pub fn new() -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self {
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            nonce: nonce[..8].to_string(),
        }
    }

    /// Allocate an id never handed out before by this channel.
    #[must_use]
    pub fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req_{n}_{}", self.nonce)
    }

    /// Number of requests currently waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Send `request` and wait for its response, a timeout, or `done`.
    ///
    /// The mailbox is removed on every exit path, including when this future
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::SessionStopped` if `done` fires (or already
    /// fired), `ControlError::Timeout` on deadline, `ControlError::Rejected`
    /// if the agent replies with an error, and `ControlError::Write` if the
    /// request cannot be written.
    pub async fn send_and_wait(
        &self,
        writer: &PeerWriter,
        request: OutboundControlRequest,
        timeout: Duration,
        done: &CancellationToken,
    ) -> Result<Value, ControlError> {
        if done.is_cancelled() {
            return Err(ControlError::SessionStopped);
        }

        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            channel: self,
            request_id: &request_id,
        };

        tracing::debug!(request_id = %request_id, ?request, "Sending control request");
        writer
            .write_message(&OutboundMessage::ControlRequest {
                request_id: request_id.clone(),
                request,
            })
            .await?;

        tokio::select! {
            biased;

            outcome = rx => match outcome {
                Ok(ControlOutcome::Success(value)) => Ok(value),
                Ok(ControlOutcome::Error(message)) => Err(ControlError::Rejected {
                    request_id: request_id.clone(),
                    message,
                }),
                // Mailbox dropped by cancel_all.
                Err(_) => Err(ControlError::SessionStopped),
            },
            () = done.cancelled() => Err(ControlError::SessionStopped),
            () = tokio::time::sleep(timeout) => {
                tracing::warn!(request_id = %request_id, "Control request timed out");
                Err(ControlError::Timeout {
                    request_id: request_id.clone(),
                    timeout,
                })
            }
        }
    }

    /// Hand a response to its waiter.
    ///
    /// Returns true if a waiter received it. Unknown ids and waiters that
    /// already gave up are silently ignored.
    pub fn deliver(&self, request_id: &str, outcome: ControlOutcome) -> bool {
        let mailbox = self.lock().remove(request_id);
        match mailbox {
            Some(tx) => {
                let delivered = tx.send(outcome).is_ok();
                tracing::debug!(request_id, delivered, "Control response delivered");
                delivered
            }
            None => {
                tracing::debug!(request_id, "Control response with no waiter, dropping");
                false
            }
        }
    }

    /// Drop every mailbox so all waiters return `SessionStopped`.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Cancelled pending control requests");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Mailbox>> {
        // A poisoned table still holds valid senders.
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct PendingGuard<'a> {
    channel: &'a ControlChannel,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.lock().remove(self.request_id);
    }
}
