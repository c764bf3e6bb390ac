//! Line framing for the agent's standard streams.
//!
//! [`PeerReader`] yields one newline-delimited line at a time from the
//! agent's stdout, enforcing a maximum line length before any JSON parsing.
//! [`PeerWriter`] serializes writers behind a single lock so concurrent
//! callers never interleave partial lines on the agent's stdin.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::host::{RecordEntry, Recorder};

/// Maximum accepted line length on the inbound stream: 16 MiB.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Error type for stream operations.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// Underlying read or write failed.
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An inbound line exceeded [`MAX_LINE_BYTES`]; it was discarded.
    #[error("Line too long: exceeded {max} bytes")]
    LineTooLong { max: usize },
    /// An outbound message could not be serialized.
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StreamError {
    /// Whether the reader can keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LineTooLong { .. })
    }
}

impl From<LinesCodecError> for StreamError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong {
                max: MAX_LINE_BYTES,
            },
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Reads newline-delimited lines from the agent's stdout.
pub struct PeerReader {
    framed: FramedRead<BoxedReader, LinesCodec>,
}

impl PeerReader {
    /// Wrap any async reader.
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_max_line(reader, MAX_LINE_BYTES)
    }

    /// Wrap a reader with a custom line limit.
    pub fn with_max_line<R>(reader: R, max: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: BoxedReader = Box::new(reader);
        Self {
            framed: FramedRead::new(boxed, LinesCodec::new_with_max_length(max)),
        }
    }

    /// Return the next full line, or `None` once the agent closes stdout.
    ///
    /// # Errors
    ///
    /// `StreamError::LineTooLong` is recoverable: the offending line is
    /// skipped and the next call continues with the following line. Any
    /// `StreamError::Io` means the stream is unusable.
    pub async fn read_line(&mut self) -> Result<Option<String>, StreamError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for PeerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerReader").finish_non_exhaustive()
    }
}

/// Writes newline-delimited JSON to the agent's stdin.
pub struct PeerWriter {
    inner: Mutex<BoxedWriter>,
    recorder: Option<Arc<dyn Recorder>>,
}

impl PeerWriter {
    /// Wrap any async writer.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Box::new(writer)),
            recorder: None,
        }
    }

    /// Report every written line to `recorder`.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Option<Arc<dyn Recorder>>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Serialize `message` as one line and write it.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Serialize` if the message cannot be encoded and
    /// `StreamError::Io` if the write fails.
    pub async fn write_message<T: Serialize + ?Sized>(
        &self,
        message: &T,
    ) -> Result<(), StreamError> {
        let line = serde_json::to_string(message)?;
        self.write_line(&line).await
    }

    /// Write one line, appending the newline delimiter.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Io` if the write fails.
    pub async fn write_line(&self, line: &str) -> Result<(), StreamError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        {
            let mut writer = self.inner.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }

        if let Some(ref recorder) = self.recorder {
            recorder.record(RecordEntry::Sent(line.to_string()));
        }
        tracing::trace!(len = line.len(), "Line written to agent");
        Ok(())
    }

    /// Close the write half so the agent sees end of input.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Io` if the shutdown fails.
    pub async fn shutdown(&self) -> Result<(), StreamError> {
        self.inner.lock().await.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PeerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerWriter")
            .field("recording", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

/// Forward the agent's stderr to the log until it closes.
pub async fn drain_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "agent_session::stderr", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Agent stderr closed with error");
                break;
            }
        }
    }
}
