//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::SpawnConfig;
use crate::permission::{AllowFirstPolicy, PermissionPolicy, ReadOnlyPolicy};
use crate::turn::{EmptyResponseRecovery, Guardrails, NeverRecover, RecoveryPolicy};

/// Soft limits, as written in the config file.
pub type GuardrailConfig = Guardrails;

/// Settings for the empty-response recovery heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Error code the heuristic matches.
    #[serde(default = "default_recovery_code")]
    pub error_code: u16,
    /// Case-insensitive substring of the error message.
    #[serde(default = "default_recovery_pattern")]
    pub message_pattern: String,
}

fn default_true() -> bool {
    true
}

fn default_recovery_code() -> u16 {
    EmptyResponseRecovery::DEFAULT_CODE
}

fn default_recovery_pattern() -> String {
    EmptyResponseRecovery::DEFAULT_PATTERN.to_string()
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_code: default_recovery_code(),
            message_pattern: default_recovery_pattern(),
        }
    }
}

impl RecoveryConfig {
    /// Build the policy these settings describe.
    #[must_use]
    pub fn policy(&self) -> Arc<dyn RecoveryPolicy> {
        if self.enabled {
            Arc::new(EmptyResponseRecovery::new(
                self.error_code,
                self.message_pattern.clone(),
            ))
        } else {
            Arc::new(NeverRecover)
        }
    }
}

/// Built-in permission policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicyKind {
    #[default]
    AllowFirst,
    ReadOnly,
}

/// Permission settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default)]
    pub policy: PermissionPolicyKind,
    /// Extra tool names the read-only policy allows.
    #[serde(default)]
    pub read_only_tools: Vec<String>,
}

impl PermissionConfig {
    #[must_use]
    pub fn policy(&self) -> Arc<dyn PermissionPolicy> {
        match self.policy {
            PermissionPolicyKind::AllowFirst => Arc::new(AllowFirstPolicy),
            PermissionPolicyKind::ReadOnly => Arc::new(
                self.read_only_tools
                    .iter()
                    .fold(ReadOnlyPolicy::new(), |p, t| p.with_read_only(t.clone())),
            ),
        }
    }
}

/// Configuration for one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Agent executable.
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    #[serde(default = "default_initialize_timeout_ms")]
    pub initialize_timeout_ms: u64,
    /// Grace window between the termination signal and the forced kill.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Capacity of the event queue. Events beyond it are dropped.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Server name the tool router answers to.
    #[serde(default = "default_tool_server_name")]
    pub tool_server_name: String,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
}

fn default_executable() -> String {
    "claude".to_string()
}

fn default_control_timeout_ms() -> u64 {
    30_000
}

fn default_initialize_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

fn default_event_buffer() -> usize {
    256
}

fn default_tool_server_name() -> String {
    "host".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            model: None,
            control_timeout_ms: default_control_timeout_ms(),
            initialize_timeout_ms: default_initialize_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            event_buffer: default_event_buffer(),
            tool_server_name: default_tool_server_name(),
            guardrails: GuardrailConfig::default(),
            recovery: RecoveryConfig::default(),
            permission: PermissionConfig::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    #[must_use]
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Spawn settings for the agent process.
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        let mut spawn = SpawnConfig::new(&self.executable)
            .args(self.args.iter().cloned())
            .envs(&self.env);
        if let Some(ref dir) = self.workdir {
            spawn = spawn.working_dir(dir);
        }
        spawn
    }
}
