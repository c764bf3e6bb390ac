//! Message types exchanged with the agent over stream-json.
//!
//! Inbound lines decode into [`Message`]; outbound lines are built from
//! [`OutboundMessage`]. Content block and delta enums carry a catch-all
//! variant so newer peers can add kinds without breaking us.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::permission::PermissionOption;

/// MCP server status reported in the init message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

/// System initialization message data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInit {
    /// Session identifier assigned by the agent.
    pub session_id: String,
    /// Model identifier.
    #[serde(default)]
    pub model: String,
    /// Agent working directory.
    #[serde(default)]
    pub cwd: String,
    /// Available tool names.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Active permission mode.
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: Option<String>,
    /// Connected MCP servers.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerStatus>,
}

/// A content block inside an assistant or user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Catch-all for block kinds we do not model.
    #[serde(other)]
    Unknown,
}

/// Flatten a tool result payload (string or list of text parts) to text.
#[must_use]
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Body of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<WireBlock>,
}

/// Assistant content message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// User message content: a plain string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

impl Default for UserContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// Body of a user message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserBody {
    #[serde(default)]
    pub content: UserContent,
}

/// User content message (carries tool results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message: UserBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Token usage for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Cached tokens, read and written.
    #[must_use]
    pub fn cached_tokens(&self) -> u64 {
        self.cache_read_input_tokens
            .saturating_add(self.cache_creation_input_tokens)
    }
}

/// Terminal turn outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Result subtype (e.g., "success", "`error_during_execution`").
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    /// Final text, or the error description when `is_error` is set.
    #[serde(default)]
    pub result: Option<String>,
    /// Cost of this turn in USD.
    #[serde(default, alias = "cost_usd")]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Usage,
}

/// Content delta types for partial streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text content delta.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// Thinking content delta.
    ThinkingDelta {
        /// The thinking fragment.
        thinking: String,
    },
    /// JSON input delta (for tool inputs).
    InputJsonDelta {
        /// Partial JSON string.
        partial_json: String,
    },
    /// Catch-all for unknown delta types.
    #[serde(other)]
    Unknown,
}

/// Raw streaming event wrapped by a `stream_event` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventBody {
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    /// `message_start`, `message_delta`, `message_stop` and anything newer.
    #[serde(other)]
    Other,
}

/// Partial streaming message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: StreamEventBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Control request subtypes the agent may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestBody {
    Initialize {
        #[serde(default)]
        hooks: Option<Value>,
    },
    /// A tunneled tool sub-protocol message.
    McpMessage { server_name: String, message: Value },
    /// Permission ask for a tool invocation.
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        permission_suggestions: Option<Value>,
        #[serde(default)]
        options: Vec<PermissionOption>,
    },
    Interrupt,
    SetPermissionMode {
        mode: String,
    },
    SetModel {
        #[serde(default)]
        model: Option<String>,
    },
    /// Catch-all for subtypes we do not model.
    #[serde(other)]
    Unknown,
}

/// An id-correlated control request from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestBody,
}

/// Outcome carried by a control response.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Success(Value),
    Error(String),
}

/// A control response from the agent, matched against our pending requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub request_id: String,
    pub outcome: ControlOutcome,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
    StreamEvent(StreamEvent),
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponse),
    /// The agent withdrew one of its own control requests.
    ControlCancel { request_id: String },
    /// A control request whose envelope parsed but whose body did not; it
    /// still needs an error reply.
    MalformedControlRequest { request_id: String, reason: String },
    /// A kind (or system subtype) we do not model; ignored by dispatch.
    Unknown(String),
}

/// Content of an outgoing user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserInput {
    Text(String),
    /// Structured content blocks passed through verbatim.
    Blocks(Vec<Value>),
}

impl UserInput {
    /// Whether the input carries nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Blocks(b) => b.is_empty(),
        }
    }
}

impl From<&str> for UserInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for UserInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<Value>> for UserInput {
    fn from(blocks: Vec<Value>) -> Self {
        Self::Blocks(blocks)
    }
}

/// Body of an outgoing user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundUserBody {
    pub role: &'static str,
    pub content: UserInput,
}

/// Control requests we send to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundControlRequest {
    Initialize {
        hooks: Option<Value>,
        #[serde(rename = "sdkMcpServers", skip_serializing_if = "Vec::is_empty")]
        sdk_mcp_servers: Vec<String>,
    },
    Interrupt,
    SetPermissionMode {
        mode: String,
    },
    SetModel {
        model: Option<String>,
    },
}

/// Control response payload we send back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundControlResponse {
    Success { request_id: String, response: Value },
    Error { request_id: String, error: String },
}

/// Messages written to the agent's stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    User {
        message: OutboundUserBody,
        parent_tool_use_id: Option<String>,
        session_id: String,
    },
    ControlRequest {
        request_id: String,
        request: OutboundControlRequest,
    },
    ControlResponse {
        response: OutboundControlResponse,
    },
}

impl OutboundMessage {
    /// A user turn.
    #[must_use]
    pub fn user(session_id: impl Into<String>, content: UserInput) -> Self {
        Self::User {
            message: OutboundUserBody {
                role: "user",
                content,
            },
            parent_tool_use_id: None,
            session_id: session_id.into(),
        }
    }

    /// A successful reply to an agent control request.
    #[must_use]
    pub fn control_success(request_id: impl Into<String>, response: Value) -> Self {
        Self::ControlResponse {
            response: OutboundControlResponse::Success {
                request_id: request_id.into(),
                response,
            },
        }
    }

    /// An error reply to an agent control request.
    #[must_use]
    pub fn control_error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ControlResponse {
            response: OutboundControlResponse::Error {
                request_id: request_id.into(),
                error: error.into(),
            },
        }
    }
}
