//! Stream-json line parser.
//!
//! Parsing happens in two steps: the line is decoded into a JSON value and
//! its `type` field selects the message kind, then the value is decoded into
//! that kind's struct. Unknown kinds decode to [`Message::Unknown`] instead of
//! failing so newer agents stay compatible.

use serde::Deserialize;
use serde_json::Value;

use super::messages::{
    AssistantMessage, ControlOutcome, ControlRequest, ControlRequestBody, ControlResponse,
    Message, ResultMessage, StreamEvent, SystemInit, UserMessage,
};

/// Error type for line parsing.
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    /// The line is not valid JSON.
    #[error("Malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The line is JSON but has no string `type` field.
    #[error("Message has no type field")]
    MissingType,
    /// A known kind is missing required fields or has wrong shapes.
    #[error("Invalid {kind} message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct ControlRequestEnvelope {
    request_id: String,
    request: Value,
}

#[derive(Deserialize)]
struct ControlResponseEnvelope {
    response: RawControlResponse,
}

#[derive(Deserialize)]
struct RawControlResponse {
    subtype: String,
    request_id: String,
    #[serde(default, alias = "result")]
    response: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ControlCancelEnvelope {
    request_id: String,
}

/// Parse one line of stream-json output.
///
/// # Errors
///
/// Returns `WireError::Malformed` for invalid JSON, `WireError::MissingType`
/// when no kind can be determined, and `WireError::Invalid` when a known kind
/// fails to decode.
pub fn parse_message(line: &str) -> Result<Message, WireError> {
    let value: Value = serde_json::from_str(line.trim()).map_err(WireError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WireError::MissingType)?
        .to_string();

    match kind.as_str() {
        "system" => parse_system(value),
        "assistant" => decode::<AssistantMessage>(&kind, value).map(Message::Assistant),
        "user" => decode::<UserMessage>(&kind, value).map(Message::User),
        "result" => decode::<ResultMessage>(&kind, value).map(Message::Result),
        "stream_event" => decode::<StreamEvent>(&kind, value).map(Message::StreamEvent),
        "control_request" => parse_control_request(&kind, value),
        "control_response" => parse_control_response(&kind, value),
        "control_cancel_request" => decode::<ControlCancelEnvelope>(&kind, value)
            .map(|env| Message::ControlCancel {
                request_id: env.request_id,
            }),
        _ => Ok(Message::Unknown(kind)),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(kind: &str, value: Value) -> Result<T, WireError> {
    serde_json::from_value(value).map_err(|source| WireError::Invalid {
        kind: kind.to_string(),
        source,
    })
}

fn parse_system(value: Value) -> Result<Message, WireError> {
    let subtype = value
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if subtype == "init" {
        decode::<SystemInit>("system", value).map(Message::SystemInit)
    } else {
        Ok(Message::Unknown(format!("system/{subtype}")))
    }
}

fn parse_control_request(kind: &str, value: Value) -> Result<Message, WireError> {
    let envelope = decode::<ControlRequestEnvelope>(kind, value)?;
    match serde_json::from_value::<ControlRequestBody>(envelope.request) {
        Ok(request) => Ok(Message::ControlRequest(ControlRequest {
            request_id: envelope.request_id,
            request,
        })),
        Err(e) => Ok(Message::MalformedControlRequest {
            request_id: envelope.request_id,
            reason: e.to_string(),
        }),
    }
}

fn parse_control_response(kind: &str, value: Value) -> Result<Message, WireError> {
    let raw = decode::<ControlResponseEnvelope>(kind, value)?.response;
    let outcome = if raw.subtype == "error" {
        let message = match raw.error {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => "unspecified error".to_string(),
        };
        ControlOutcome::Error(message)
    } else {
        ControlOutcome::Success(raw.response.unwrap_or(Value::Null))
    };
    Ok(Message::ControlResponse(ControlResponse {
        request_id: raw.request_id,
        outcome,
    }))
}
