//! Session handle, builder, and shutdown.
//!
//! A [`Session`] owns one agent peer. A background reader task decodes the
//! peer's output and dispatches it. Callers submit turns, issue control
//! requests, and observe progress through the event stream. All shared
//! state sits behind short, synchronous critical sections that are never
//! held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::events::{ErrorContext, EventEmitter, EventStream, SessionEvent};
use super::reader;
use super::state::{SessionState, SessionStateMachine, SessionStats, StateError};
use crate::cli::{drain_stderr, AgentProcess, PeerReader, PeerWriter, SpawnError};
use crate::config::SessionConfig;
use crate::control::ControlChannel;
use crate::error::SessionError;
use crate::host::{RecordEntry, Recorder};
use crate::permission::{PermissionGateway, PermissionPolicy};
use crate::tools::{ToolEntry, ToolRouter};
use crate::turn::{Guardrails, RecoveryPolicy, Turn, TurnAccumulator, TurnError, TurnResult};
use crate::wire::{OutboundControlRequest, OutboundMessage, SystemInit, UserInput};

const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Session id sent before the agent has announced one.
const DEFAULT_SESSION_ID: &str = "default";

/// What the agent told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    pub permission_mode: Option<String>,
    pub mcp_servers: Vec<String>,
}

impl SessionMetadata {
    pub(crate) fn apply_init(&mut self, init: &SystemInit) {
        fn non_empty(s: &str) -> Option<String> {
            (!s.is_empty()).then(|| s.to_string())
        }
        if let Some(id) = non_empty(&init.session_id) {
            self.session_id = Some(id);
        }
        if let Some(model) = non_empty(&init.model) {
            self.model = Some(model);
        }
        self.cwd = non_empty(&init.cwd).or(self.cwd.take());
        self.tools.clone_from(&init.tools);
        if init.permission_mode.is_some() {
            self.permission_mode.clone_from(&init.permission_mode);
        }
        self.mcp_servers = init.mcp_servers.iter().map(|s| s.name.clone()).collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ShutdownCause {
    Requested,
    PeerClosed,
    ReadFailed,
}

pub(super) struct Core {
    pub(super) state: SessionStateMachine,
    pub(super) turns: TurnAccumulator,
}

pub(super) struct Inner {
    pub(super) config: SessionConfig,
    core: Mutex<Core>,
    metadata: RwLock<SessionMetadata>,
    pub(super) control: ControlChannel,
    pub(super) writer: PeerWriter,
    process: tokio::sync::Mutex<Option<AgentProcess>>,
    pid: Option<u32>,
    pub(super) events: EventEmitter,
    pub(super) router: ToolRouter,
    pub(super) gateway: PermissionGateway,
    pub(super) recovery: Arc<dyn RecoveryPolicy>,
    pub(super) guardrails: Guardrails,
    recorder: Option<Arc<dyn Recorder>>,
    pub(super) done: CancellationToken,
    pub(super) tasks: TaskTracker,
    inflight: Mutex<HashMap<String, AbortHandle>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    /// Cancelled once teardown has finished.
    stopped: CancellationToken,
}

impl Inner {
    pub(super) fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn inflight(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metadata(&self) -> SessionMetadata {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(super) fn update_metadata(&self, f: impl FnOnce(&mut SessionMetadata)) {
        f(&mut self
            .metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner));
    }

    pub(super) fn record(&self, entry: RecordEntry) {
        if let Some(ref recorder) = self.recorder {
            recorder.record(entry);
        }
    }

    pub(super) fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    /// Abort the in-flight handler for an agent request. False if none.
    pub(super) fn cancel_inflight(&self, request_id: &str) -> bool {
        match self.inflight().remove(request_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Write a reply to the agent, reporting failures unless shutting down.
    pub(super) async fn reply(&self, message: OutboundMessage) {
        if self.done.is_cancelled() {
            return;
        }
        if let Err(e) = self.writer.write_message(&message).await {
            if !self.done.is_cancelled() {
                tracing::warn!(error = %e, "Failed to write reply to agent");
                self.emit(SessionEvent::error(&e, ErrorContext::Write));
            }
        }
    }

    pub(super) fn finish_turn(&self, result: &TurnResult) {
        self.record(RecordEntry::TurnEnd {
            number: result.number,
            success: result.success,
        });
        self.emit(SessionEvent::turn_complete(result));
    }

    /// End the turn in flight locally and return to `Ready`.
    fn abandon_turn(&self, error: TurnError) -> Option<TurnResult> {
        let result = {
            let mut core = self.core();
            let result = core.turns.abandon(error)?;
            core.state.record_turn_finished(false);
            if let Err(e) = core.state.transition(SessionState::Ready) {
                tracing::debug!(error = %e, "Abandoned turn without returning to ready");
            }
            result
        };
        self.finish_turn(&result);
        Some(result)
    }

    /// Tear the session down and wait until teardown has finished.
    ///
    /// Only the first call starts the teardown. Later callers wait for the
    /// same completion.
    pub(super) async fn shutdown(self: &Arc<Self>, cause: ShutdownCause) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(self);
            // Detached so aborting a caller cannot interrupt it halfway.
            tokio::spawn(async move {
                inner.teardown(cause).await;
                inner.stopped.cancel();
            });
        }
        self.stopped.cancelled().await;
    }

    async fn teardown(&self, cause: ShutdownCause) {
        tracing::info!(?cause, "Stopping session");
        self.done.cancel();
        self.control.cancel_all();

        let abandoned = {
            let mut core = self.core();
            let abandoned = core.turns.abandon(TurnError::SessionClosed);
            if abandoned.is_some() {
                core.state.record_turn_finished(false);
            }
            core.state.close();
            abandoned
        };
        if let Some(result) = abandoned {
            self.finish_turn(&result);
        }
        if cause == ShutdownCause::PeerClosed {
            self.emit(SessionEvent::error(
                "agent closed its output",
                ErrorContext::Read,
            ));
        }

        for (_, handle) in self.inflight().drain() {
            handle.abort();
        }
        self.tasks.close();

        match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Error closing agent stdin"),
            Err(_) => tracing::debug!("Timed out closing agent stdin"),
        }

        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            if let Err(e) = process.stop(self.config.shutdown_grace()).await {
                tracing::warn!(error = %e, "Failed to stop agent process");
            }
        }

        self.events.close();
        tracing::info!("Session stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Builder for a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    tools: Vec<ToolEntry>,
    permission: Option<Arc<dyn PermissionPolicy>>,
    recovery: Option<Arc<dyn RecoveryPolicy>>,
    recorder: Option<Arc<dyn Recorder>>,
}

impl SessionBuilder {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            permission: None,
            recovery: None,
            recorder: None,
        }
    }

    /// Register a tool the agent may call back into.
    #[must_use]
    pub fn tool(mut self, entry: ToolEntry) -> Self {
        self.tools.push(entry);
        self
    }

    #[must_use]
    pub fn tools(mut self, entries: impl IntoIterator<Item = ToolEntry>) -> Self {
        self.tools.extend(entries);
        self
    }

    /// Override the permission policy named in the config.
    #[must_use]
    pub fn permission_policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.permission = Some(policy);
        self
    }

    /// Override the recovery policy named in the config.
    #[must_use]
    pub fn recovery_policy(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.recovery = Some(policy);
        self
    }

    /// Record every wire line and turn boundary.
    #[must_use]
    pub fn recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Spawn the configured agent and complete the initialize handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started or the handshake
    /// fails. The process is stopped before returning an error.
    pub async fn spawn(self) -> Result<Session, SessionError> {
        let mut process = AgentProcess::spawn(&self.config.spawn_config())?;
        let stdin = process
            .take_stdin()
            .ok_or(SpawnError::MissingStream("stdin"))?;
        let stdout = process
            .take_stdout()
            .ok_or(SpawnError::MissingStream("stdout"))?;
        if let Some(stderr) = process.take_stderr() {
            tokio::spawn(drain_stderr(stderr));
        }
        self.start(PeerReader::new(stdout), PeerWriter::new(stdin), Some(process))
            .await
    }

    /// Run a session over an already-connected byte stream pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the initialize handshake fails.
    pub async fn connect<R, W>(self, reader: R, writer: W) -> Result<Session, SessionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.start(PeerReader::new(reader), PeerWriter::new(writer), None)
            .await
    }

    async fn start(
        self,
        reader: PeerReader,
        writer: PeerWriter,
        process: Option<AgentProcess>,
    ) -> Result<Session, SessionError> {
        let router = ToolRouter::new(&self.config.tool_server_name).with_tools(self.tools);
        let permission = self
            .permission
            .unwrap_or_else(|| self.config.permission.policy());
        let recovery = self
            .recovery
            .unwrap_or_else(|| self.config.recovery.policy());
        let metadata = SessionMetadata {
            model: self.config.model.clone(),
            ..SessionMetadata::default()
        };

        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                state: SessionStateMachine::new(),
                turns: TurnAccumulator::new(),
            }),
            metadata: RwLock::new(metadata),
            control: ControlChannel::new(),
            writer: writer.with_recorder(self.recorder.clone()),
            pid: process.as_ref().and_then(AgentProcess::id),
            process: tokio::sync::Mutex::new(process),
            events: EventEmitter::new(self.config.event_buffer),
            router,
            gateway: PermissionGateway::new(permission),
            recovery,
            guardrails: self.config.guardrails,
            recorder: self.recorder,
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
            inflight: Mutex::new(HashMap::new()),
            reader_task: Mutex::new(None),
            stopping: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            config: self.config,
        });
        let session = Session { inner };

        session.inner.core().state.transition(SessionState::Starting)?;
        let handle = tokio::spawn(reader::run(
            Arc::downgrade(&session.inner),
            session.inner.done.clone(),
            reader,
        ));
        *session
            .inner
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if let Err(e) = session.initialize().await {
            tracing::error!(error = %e, "Initialize handshake failed");
            session.stop().await;
            return Err(e);
        }
        Ok(session)
    }
}

/// Handle to a running agent session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("pid", &self.inner.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn an agent with `config` and no host tools.
    ///
    /// # Errors
    ///
    /// See [`SessionBuilder::spawn`].
    pub async fn spawn(config: SessionConfig) -> Result<Self, SessionError> {
        SessionBuilder::new(config).spawn().await
    }

    async fn initialize(&self) -> Result<(), SessionError> {
        let sdk_mcp_servers = if self.inner.router.is_empty() {
            Vec::new()
        } else {
            vec![self.inner.router.server_name().to_string()]
        };
        let response = self
            .inner
            .control
            .send_and_wait(
                &self.inner.writer,
                OutboundControlRequest::Initialize {
                    hooks: None,
                    sdk_mcp_servers,
                },
                self.inner.config.initialize_timeout(),
                &self.inner.done,
            )
            .await?;
        tracing::debug!(%response, "Initialize accepted");

        self.transition(SessionState::Ready)?;
        let session_id = self.inner.metadata().session_id;
        tracing::info!(session_id = ?session_id, pid = ?self.inner.pid, "Session ready");
        self.inner.emit(SessionEvent::Ready { session_id });
        Ok(())
    }

    fn transition(&self, to: SessionState) -> Result<(), SessionError> {
        let mut core = self.inner.core();
        if core.state.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        core.state.transition(to)?;
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Uninitialized | SessionState::Starting => Err(SessionError::NotStarted),
            SessionState::Ready | SessionState::Processing => Ok(()),
        }
    }

    /// Take the event stream. Only the first call gets it.
    #[must_use]
    pub fn take_events(&self) -> Option<EventStream> {
        self.inner.events.take_stream()
    }

    /// Start a turn and return its number without waiting for the result.
    ///
    /// Completion is reported through a `TurnComplete` event.
    ///
    /// # Errors
    ///
    /// Returns an error for empty input, when a turn is already in flight,
    /// when the session is not ready, or when the input cannot be written.
    pub async fn submit(&self, content: impl Into<UserInput>) -> Result<u64, SessionError> {
        self.begin_turn(content.into(), None).await
    }

    /// Run one turn to completion.
    ///
    /// # Errors
    ///
    /// Everything [`Session::submit`] returns, plus `TurnFailed` when the
    /// turn ends unsuccessfully and `Closed` if the session stops first.
    pub async fn send(&self, content: impl Into<UserInput>) -> Result<TurnResult, SessionError> {
        let (tx, rx) = oneshot::channel();
        let number = self.begin_turn(content.into(), Some(tx)).await?;
        let result = rx.await.map_err(|_| SessionError::Closed)?;
        match result.error {
            None => Ok(result),
            Some(TurnError::SessionClosed) => Err(SessionError::Closed),
            Some(error) => Err(SessionError::TurnFailed { number, error }),
        }
    }

    async fn begin_turn(
        &self,
        content: UserInput,
        waiter: Option<oneshot::Sender<TurnResult>>,
    ) -> Result<u64, SessionError> {
        if content.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        let number = {
            let mut core = self.inner.core();
            match core.state.state() {
                SessionState::Closed => return Err(SessionError::Closed),
                SessionState::Uninitialized | SessionState::Starting => {
                    return Err(SessionError::NotStarted)
                }
                SessionState::Processing => {
                    let turn = core.turns.current().map_or(0, |t| t.number);
                    return Err(StateError::TurnInFlight { turn }.into());
                }
                SessionState::Ready => {}
            }
            core.state.transition(SessionState::Processing)?;
            core.state.record_turn_started();
            core.turns.start_turn(waiter)
        };
        self.inner.record(RecordEntry::TurnStart(number));

        let session_id = self
            .inner
            .metadata()
            .session_id
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());
        tracing::info!(turn = number, "Turn submitted");
        let message = OutboundMessage::user(session_id, content);
        if let Err(e) = self.inner.writer.write_message(&message).await {
            tracing::warn!(turn = number, error = %e, "Failed to send turn input");
            self.inner.abandon_turn(TurnError::Abandoned {
                reason: format!("failed to send input: {e}"),
            });
            return Err(e.into());
        }
        Ok(number)
    }

    async fn control(&self, request: OutboundControlRequest) -> Result<Value, SessionError> {
        self.ensure_started()?;
        let response = self
            .inner
            .control
            .send_and_wait(
                &self.inner.writer,
                request,
                self.inner.config.control_timeout(),
                &self.inner.done,
            )
            .await?;
        Ok(response)
    }

    /// Ask the agent to stop the turn in flight.
    ///
    /// The turn still ends with the agent's result message.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent rejects the request or does not answer
    /// in time.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        tracing::info!("Interrupting agent");
        self.control(OutboundControlRequest::Interrupt).await?;
        Ok(())
    }

    /// Change the agent's permission mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent rejects the mode.
    pub async fn set_permission_mode(&self, mode: impl Into<String>) -> Result<(), SessionError> {
        let mode = mode.into();
        self.control(OutboundControlRequest::SetPermissionMode { mode: mode.clone() })
            .await?;
        self.inner
            .update_metadata(|m| m.permission_mode = Some(mode));
        Ok(())
    }

    /// Switch models. `None` restores the agent's default.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent rejects the model.
    pub async fn set_model(&self, model: Option<String>) -> Result<(), SessionError> {
        self.control(OutboundControlRequest::SetModel {
            model: model.clone(),
        })
        .await?;
        self.inner.update_metadata(|m| m.model = model);
        Ok(())
    }

    /// Abandon the turn in flight locally, making the session ready again.
    ///
    /// Use this when the agent stopped responding mid-turn. Returns the
    /// abandoned turn, or `None` if nothing was in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or never started.
    pub fn recover(&self) -> Result<Option<TurnResult>, SessionError> {
        self.ensure_started()?;
        Ok(self.inner.abandon_turn(TurnError::Abandoned {
            reason: "recovered by caller".to_string(),
        }))
    }

    /// Stop the session and the agent process. Safe to call more than once.
    ///
    /// Returns once the process is stopped and the event stream has closed,
    /// including when the agent's exit started the teardown.
    pub async fn stop(&self) {
        self.inner.shutdown(ShutdownCause::Requested).await;
        let handle = self
            .inner
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.core().state.state()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    #[must_use]
    pub fn metadata(&self) -> SessionMetadata {
        self.inner.metadata()
    }

    /// OS process id of the agent, if this session spawned one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Snapshot of the turn in flight.
    #[must_use]
    pub fn current_turn(&self) -> Option<Turn> {
        self.inner.core().turns.current().cloned()
    }

    /// Total cost across completed turns in USD.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        self.inner.core().turns.total_cost_usd()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.inner.core().state.stats()
    }

    /// Events discarded because the consumer fell behind.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.events.dropped()
    }

    /// Control requests still awaiting an answer from the agent.
    #[must_use]
    pub fn pending_control_requests(&self) -> usize {
        self.inner.control.pending_count()
    }
}
