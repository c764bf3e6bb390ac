//! Agent process spawning and control.
//!
//! This module provides a builder for configuring the peer executable and a
//! handle that owns the running child. The child is placed in its own process
//! group so shutdown reaches every descendant, and on Linux it is asked to
//! receive `SIGTERM` if this process dies first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;

/// Grace window between the termination signal and the forced kill.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on how long we wait for the child to be reaped after `SIGKILL`.
const KILL_REAP_TIMEOUT: Duration = Duration::from_millis(500);
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("Agent binary not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied spawning {0}")]
    PermissionDenied(String),
    /// A standard stream could not be captured.
    #[error("Failed to capture child {0}")]
    MissingStream(&'static str),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(executable: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(executable.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(executable.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Whether retrying the spawn cannot help.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Builder for the peer executable's command line and environment.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    executable: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl SpawnConfig {
    /// Create a new builder for the given executable.
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    /// Append arguments, passed verbatim.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables for the child.
    #[must_use]
    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set the working directory for the agent process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the executable name.
    #[must_use]
    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Get the argument list.
    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn get_working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(target_os = "linux")]
        set_parent_death_signal(&mut cmd);

        cmd
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_parent_death_signal(cmd: &mut Command) {
    // SAFETY: the hook runs in the forked child before exec and only calls
    // prctl(2), which is async-signal-safe and touches no parent memory.
    unsafe {
        cmd.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
                .map_err(std::io::Error::from)
        });
    }
}

/// A running agent process.
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    pid: Option<u32>,
    stopped: bool,
}

impl AgentProcess {
    /// Spawn the agent process described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError::NotFound` if the executable cannot be located and
    /// other `SpawnError` variants for every other spawn failure.
    pub fn spawn(config: &SpawnConfig) -> Result<Self, SpawnError> {
        let child = config
            .command()
            .spawn()
            .map_err(|e| SpawnError::from_io(config.executable(), e))?;
        let pid = child.id();

        tracing::info!(
            executable = %config.executable(),
            pid = ?pid,
            args = config.get_args().len(),
            "Agent process spawned"
        );

        Ok(Self {
            child,
            pid,
            stopped: false,
        })
    }

    /// Take ownership of the stdin handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Get the process ID recorded at spawn time.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Whether `stop` has already run.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Terminate the process group: `SIGTERM`, wait up to `grace`, then
    /// `SIGKILL`.
    ///
    /// The whole group is signalled even when the agent itself has already
    /// exited, so descendants it left behind are reached too. Idempotent.
    /// Returns within roughly `grace` plus a small constant no matter how
    /// the peer reacts to the signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the forced kill cannot be delivered.
    pub async fn stop(&mut self, grace: Duration) -> std::io::Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let deadline = Instant::now() + grace;

        let leader_exited = self.child.try_wait()?.is_some();
        if leader_exited {
            tracing::debug!(pid = ?self.pid, "Agent process already exited");
        }
        self.signal_group(GroupSignal::Terminate);

        if !leader_exited {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(pid = ?self.pid, %status, "Agent process exited after SIGTERM");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!(
                        pid = ?self.pid,
                        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                        "Grace window elapsed, killing agent process group"
                    );
                }
            }
        }

        if self.wait_group_exit(deadline).await {
            return Ok(());
        }

        self.signal_group(GroupSignal::Kill);
        self.child.start_kill().or_else(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                // Already reaped.
                Ok(())
            } else {
                Err(e)
            }
        })?;

        if tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!(pid = ?self.pid, "Agent process not reaped after SIGKILL");
        }
        Ok(())
    }

    /// Poll until no process is left in the group or `deadline` passes.
    async fn wait_group_exit(&mut self, deadline: Instant) -> bool {
        loop {
            if !self.group_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Whether any member of the agent's process group is still around.
    #[cfg(unix)]
    fn group_alive(&mut self) -> bool {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        // Reap the leader first so its zombie does not count.
        if let Ok(None) = self.child.try_wait() {
            return true;
        }
        let Some(raw) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return false;
        };
        killpg(Pid::from_raw(raw), None).is_ok()
    }

    #[cfg(not(unix))]
    fn group_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn signal_group(&self, which: GroupSignal) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        let signal = match which {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        if let Err(e) = killpg(Pid::from_raw(raw), signal) {
            tracing::debug!(pid, ?signal, error = %e, "killpg failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, which: GroupSignal) {
        if matches!(which, GroupSignal::Terminate) {
            let _ = self.child.start_kill();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}
