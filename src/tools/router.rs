//! Tool router answering the tunneled tool sub-protocol.
//!
//! Metadata methods are answered inline. `tools/call` yields a
//! [`RouterReply::Pending`] future which the session runs on its own task, so
//! a slow handler never holds up the reader. The future contains a panic
//! boundary and always resolves to a response.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};

use super::jsonrpc::{
    self, RpcRequest, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION,
};

/// Output of a successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<Value>,
    pub structured: Option<Value>,
}

impl ToolOutput {
    /// Plain text output.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text.into() })],
            structured: None,
        }
    }

    /// JSON output, also rendered as text for agents that ignore structure.
    #[must_use]
    pub fn json(value: Value) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": value.to_string() })],
            structured: Some(value),
        }
    }

    fn into_result(self) -> Value {
        let mut result = json!({ "content": self.content, "isError": false });
        if let Some(structured) = self.structured {
            result["structuredContent"] = structured;
        }
        result
    }
}

/// Error type for tool handlers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolCallError {
    /// Arguments did not match the tool's schema.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    /// The tool ran and failed; reported to the agent as a tool error.
    #[error("{0}")]
    Failed(String),
}

/// A callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<ToolOutput, ToolCallError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput, ToolCallError>> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<ToolOutput, ToolCallError> {
        (self.0)(args).await
    }
}

/// A registered tool. Immutable once added to a router.
#[derive(Clone)]
pub struct ToolEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolEntry {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }

    /// Build an entry from an async closure.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolCallError>> + Send + 'static,
    {
        Self::new(name, description, input_schema, Arc::new(FnHandler(f)))
    }

    fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// How a sub-protocol message is answered.
pub enum RouterReply {
    Ready(Value),
    /// A tool call; run it off the reader task.
    Pending(BoxFuture<'static, Value>),
}

impl RouterReply {
    /// Wait for the response.
    pub async fn resolve(self) -> Value {
        match self {
            Self::Ready(value) => value,
            Self::Pending(fut) => fut.await,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl std::fmt::Debug for RouterReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Answers tool metadata and call requests for one server name.
#[derive(Debug, Clone)]
pub struct ToolRouter {
    server_name: String,
    version: String,
    tools: Vec<ToolEntry>,
}

impl ToolRouter {
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tools: Vec::new(),
        }
    }

    /// Register a tool. A later entry with the same name replaces the earlier.
    #[must_use]
    pub fn with_tool(mut self, entry: ToolEntry) -> Self {
        self.tools.retain(|t| t.name != entry.name);
        self.tools.push(entry);
        self
    }

    #[must_use]
    pub fn with_tools(self, entries: impl IntoIterator<Item = ToolEntry>) -> Self {
        entries.into_iter().fold(self, Self::with_tool)
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Answer one sub-protocol message addressed to `server_name`.
    #[must_use]
    pub fn handle(&self, server_name: &str, message: &Value) -> RouterReply {
        let raw_id = message.get("id");

        if server_name != self.server_name {
            tracing::warn!(server = %server_name, "Tool request for unknown server");
            return RouterReply::Ready(jsonrpc::failure(
                raw_id,
                METHOD_NOT_FOUND,
                format!("Unknown server: {server_name}"),
            ));
        }

        let request: RpcRequest = match serde_json::from_value(message.clone()) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed tool sub-protocol message");
                return RouterReply::Ready(jsonrpc::failure(
                    raw_id,
                    PARSE_ERROR,
                    format!("Parse error: {e}"),
                ));
            }
        };
        let id = request.id.as_ref();
        tracing::debug!(method = %request.method, "Tool sub-protocol request");

        match request.method.as_str() {
            "initialize" => RouterReply::Ready(jsonrpc::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.server_name, "version": self.version },
                }),
            )),
            "notifications/initialized" | "initialized" | "ping" => {
                RouterReply::Ready(jsonrpc::success(id, json!({})))
            }
            "tools/list" => {
                let tools: Vec<Value> = self.tools.iter().map(ToolEntry::describe).collect();
                RouterReply::Ready(jsonrpc::success(id, json!({ "tools": tools })))
            }
            "tools/call" => self.call(request.id.clone(), &request.params),
            other => RouterReply::Ready(jsonrpc::failure(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    fn call(&self, id: Option<Value>, params: &Value) -> RouterReply {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return RouterReply::Ready(jsonrpc::failure(
                id.as_ref(),
                INVALID_PARAMS,
                "Missing tool name",
            ));
        };
        let Some(entry) = self.tools.iter().find(|t| t.name == name) else {
            return RouterReply::Ready(jsonrpc::failure(
                id.as_ref(),
                INVALID_PARAMS,
                format!("Unknown tool: {name}"),
            ));
        };
        let args = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(v @ Value::Object(_)) => v.clone(),
            Some(_) => {
                return RouterReply::Ready(jsonrpc::failure(
                    id.as_ref(),
                    INVALID_PARAMS,
                    "Tool arguments must be an object",
                ));
            }
        };

        let handler = Arc::clone(&entry.handler);
        let tool = entry.name.clone();
        RouterReply::Pending(Box::pin(async move {
            match AssertUnwindSafe(handler.call(args)).catch_unwind().await {
                Ok(Ok(output)) => jsonrpc::success(id.as_ref(), output.into_result()),
                Ok(Err(ToolCallError::InvalidArguments(msg))) => {
                    jsonrpc::failure(id.as_ref(), INVALID_PARAMS, msg)
                }
                Ok(Err(ToolCallError::Failed(msg))) => {
                    tracing::debug!(tool = %tool, error = %msg, "Tool call failed");
                    jsonrpc::success(
                        id.as_ref(),
                        json!({
                            "content": [{ "type": "text", "text": msg }],
                            "isError": true,
                        }),
                    )
                }
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    tracing::warn!(tool = %tool, panic = %detail, "Tool handler panicked");
                    jsonrpc::failure(
                        id.as_ref(),
                        INTERNAL_ERROR,
                        format!("Tool {tool} failed unexpectedly: {detail}"),
                    )
                }
            }
        }))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
