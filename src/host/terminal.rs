//! Terminal capability exposed to the agent as tools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::{ToolCallError, ToolEntry, ToolOutput};

/// Opaque id of a terminal created by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalHandle(pub String);

impl std::fmt::Display for TerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A command to run in a new terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TerminalRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Output captured so far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TerminalOutput {
    pub text: String,
    /// Set once the command has exited.
    pub exit_code: Option<i32>,
}

/// Host command execution.
#[async_trait]
pub trait TerminalProvider: Send + Sync {
    async fn create(&self, request: TerminalRequest) -> std::io::Result<TerminalHandle>;

    async fn output(&self, handle: &TerminalHandle) -> std::io::Result<TerminalOutput>;

    /// Wait for the command to exit. `None` means it died from a signal.
    async fn wait_for_exit(&self, handle: &TerminalHandle) -> std::io::Result<Option<i32>>;

    async fn kill(&self, handle: &TerminalHandle) -> std::io::Result<()>;

    /// Free the terminal. The handle is invalid afterwards.
    async fn release(&self, handle: &TerminalHandle) -> std::io::Result<()>;
}

#[derive(Deserialize)]
struct HandleArgs {
    #[serde(rename = "terminalId")]
    terminal_id: TerminalHandle,
}

fn handle_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "terminalId": { "type": "string" } },
        "required": ["terminalId"]
    })
}

fn failed(action: &str, err: &std::io::Error) -> ToolCallError {
    ToolCallError::Failed(format!("Terminal {action} failed: {err}"))
}

fn parse_handle(args: Value) -> Result<TerminalHandle, ToolCallError> {
    serde_json::from_value::<HandleArgs>(args)
        .map(|a| a.terminal_id)
        .map_err(|e| ToolCallError::InvalidArguments(e.to_string()))
}

/// Register `terminal_*` tools backed by `provider`.
pub fn terminal_tools(provider: Arc<dyn TerminalProvider>) -> Vec<ToolEntry> {
    let p = Arc::clone(&provider);
    let create = ToolEntry::from_fn(
        "terminal_create",
        "Start a command in a new host terminal",
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "args": { "type": "array", "items": { "type": "string" } },
                "cwd": { "type": "string" },
                "env": { "type": "object", "additionalProperties": { "type": "string" } }
            },
            "required": ["command"]
        }),
        move |args| {
            let provider = Arc::clone(&p);
            async move {
                let request: TerminalRequest = serde_json::from_value(args)
                    .map_err(|e| ToolCallError::InvalidArguments(e.to_string()))?;
                tracing::debug!(command = %request.command, "Creating terminal");
                let handle = provider
                    .create(request)
                    .await
                    .map_err(|e| failed("create", &e))?;
                Ok::<_, ToolCallError>(ToolOutput::json(json!({ "terminalId": handle })))
            }
        },
    );

    let p = Arc::clone(&provider);
    let output = ToolEntry::from_fn(
        "terminal_output",
        "Read the output a terminal has produced so far",
        handle_schema(),
        move |args| {
            let provider = Arc::clone(&p);
            async move {
                let handle = parse_handle(args)?;
                let out = provider
                    .output(&handle)
                    .await
                    .map_err(|e| failed("output", &e))?;
                Ok::<_, ToolCallError>(ToolOutput::json(json!({
                    "output": out.text,
                    "exitCode": out.exit_code,
                })))
            }
        },
    );

    let p = Arc::clone(&provider);
    let wait = ToolEntry::from_fn(
        "terminal_wait_for_exit",
        "Wait until a terminal's command exits",
        handle_schema(),
        move |args| {
            let provider = Arc::clone(&p);
            async move {
                let handle = parse_handle(args)?;
                let code = provider
                    .wait_for_exit(&handle)
                    .await
                    .map_err(|e| failed("wait", &e))?;
                Ok::<_, ToolCallError>(ToolOutput::json(json!({ "exitCode": code })))
            }
        },
    );

    let p = Arc::clone(&provider);
    let kill = ToolEntry::from_fn(
        "terminal_kill",
        "Kill a terminal's command",
        handle_schema(),
        move |args| {
            let provider = Arc::clone(&p);
            async move {
                let handle = parse_handle(args)?;
                provider.kill(&handle).await.map_err(|e| failed("kill", &e))?;
                Ok::<_, ToolCallError>(ToolOutput::json(json!({})))
            }
        },
    );

    let release = ToolEntry::from_fn(
        "terminal_release",
        "Release a terminal and its resources",
        handle_schema(),
        move |args| {
            let provider = Arc::clone(&provider);
            async move {
                let handle = parse_handle(args)?;
                provider
                    .release(&handle)
                    .await
                    .map_err(|e| failed("release", &e))?;
                Ok::<_, ToolCallError>(ToolOutput::json(json!({})))
            }
        },
    );

    vec![create, output, wait, kill, release]
}
