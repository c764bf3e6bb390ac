//! Filesystem capability exposed to the agent as tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tools::{ToolCallError, ToolEntry, ToolOutput};

/// A 1-based line window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub limit: Option<usize>,
}

impl LineRange {
    /// Cut `content` down to this window.
    #[must_use]
    pub fn apply(&self, content: &str) -> String {
        let skip = self.start.saturating_sub(1);
        let lines = content.lines().skip(skip);
        let selected: Vec<&str> = match self.limit {
            Some(limit) => lines.take(limit).collect(),
            None => lines.collect(),
        };
        selected.join("\n")
    }
}

/// Host filesystem access.
#[async_trait]
pub trait FilesystemProvider: Send + Sync {
    async fn read_text_file(&self, path: &Path, range: Option<LineRange>)
        -> std::io::Result<String>;

    async fn write_text_file(&self, path: &Path, content: &str) -> std::io::Result<()>;
}

#[derive(Deserialize)]
struct ReadArgs {
    path: PathBuf,
    #[serde(default)]
    line: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: PathBuf,
    content: String,
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: serde_json::Value) -> Result<T, ToolCallError> {
    serde_json::from_value(args).map_err(|e| ToolCallError::InvalidArguments(e.to_string()))
}

/// `read_text_file` and `write_text_file` tools backed by `provider`.
///
/// Reading a missing file yields empty content, since agents probe for
/// existence before writing.
pub fn filesystem_tools(provider: Arc<dyn FilesystemProvider>) -> Vec<ToolEntry> {
    let reader = Arc::clone(&provider);
    let read = ToolEntry::from_fn(
        "read_text_file",
        "Read a text file from the host, optionally a line window",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "line": { "type": "integer", "minimum": 1 },
                "limit": { "type": "integer", "minimum": 1 }
            },
            "required": ["path"]
        }),
        move |args| {
            let provider = Arc::clone(&reader);
            async move {
                let args: ReadArgs = parse_args(args)?;
                let range = (args.line.is_some() || args.limit.is_some()).then(|| LineRange {
                    start: args.line.unwrap_or(1),
                    limit: args.limit,
                });
                match provider.read_text_file(&args.path, range).await {
                    Ok(content) => Ok::<_, ToolCallError>(ToolOutput::text(content)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::debug!(path = %args.path.display(), "Read of missing file");
                        Ok(ToolOutput::text(String::new()))
                    }
                    Err(e) => Err(ToolCallError::Failed(format!(
                        "Failed to read {}: {e}",
                        args.path.display()
                    ))),
                }
            }
        },
    );

    let write = ToolEntry::from_fn(
        "write_text_file",
        "Write a text file on the host",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        }),
        move |args| {
            let provider = Arc::clone(&provider);
            async move {
                let args: WriteArgs = parse_args(args)?;
                provider
                    .write_text_file(&args.path, &args.content)
                    .await
                    .map_err(|e| {
                        ToolCallError::Failed(format!("Failed to write {}: {e}", args.path.display()))
                    })?;
                Ok::<_, ToolCallError>(ToolOutput::text(format!(
                    "Wrote {} bytes to {}",
                    args.content.len(),
                    args.path.display()
                )))
            }
        },
    );

    vec![read, write]
}
