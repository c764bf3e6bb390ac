//! Folds streamed content into the current turn.
//!
//! Every `apply_*` method returns the updates it caused so the session can
//! turn them into events after releasing its lock. Updates carry owned
//! snapshots, never references into the turn.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::guardrail::Guardrails;
use super::recovery::{RecoveryPolicy, TurnActivity};
use super::result::{TurnError, TurnResult};
use crate::wire::{
    tool_result_text, AssistantMessage, ContentDelta, ResultMessage, StreamEvent,
    StreamEventBody, UserContent, UserMessage, WireBlock,
};

/// Name used for tool results whose call was never observed.
pub const UNKNOWN_TOOL: &str = "unknown";

/// One piece of turn content, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

/// Lifecycle of an observed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Name known, input still streaming.
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A tool call observed during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistration {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
}

/// Something a consumer should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    TextDelta {
        delta: String,
        accumulated: String,
    },
    ThinkingDelta {
        delta: String,
        accumulated: String,
    },
    ToolStart(ToolRegistration),
    ToolUpdate(ToolRegistration),
}

#[derive(Debug, Clone)]
struct PartialToolInput {
    id: String,
    json: String,
}

/// The turn in flight.
#[derive(Debug, Clone)]
pub struct Turn {
    pub number: u64,
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub text: String,
    pub thinking: String,
    pub blocks: Vec<ContentBlock>,
    pub tools: HashMap<String, ToolRegistration>,
    tool_order: Vec<String>,
    saw_partial: bool,
    partial_inputs: HashMap<usize, PartialToolInput>,
}

impl Turn {
    fn new(number: u64) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            started: Instant::now(),
            text: String::new(),
            thinking: String::new(),
            blocks: Vec::new(),
            tools: HashMap::new(),
            tool_order: Vec::new(),
            saw_partial: false,
            partial_inputs: HashMap::new(),
        }
    }

    /// Time since the turn started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Tool registrations in the order they were first seen.
    #[must_use]
    pub fn tools_in_order(&self) -> Vec<ToolRegistration> {
        self.tool_order
            .iter()
            .filter_map(|id| self.tools.get(id).cloned())
            .collect()
    }

    #[must_use]
    pub fn activity(&self) -> TurnActivity {
        TurnActivity {
            has_text: !self.text.is_empty(),
            has_thinking: !self.thinking.is_empty(),
            has_tool_activity: !self.tools.is_empty()
                || self
                    .blocks
                    .iter()
                    .any(|b| matches!(b, ContentBlock::ToolResult { .. })),
        }
    }

    fn push_text(&mut self, delta: &str) -> TurnUpdate {
        self.text.push_str(delta);
        match self.blocks.last_mut() {
            Some(ContentBlock::Text { text }) => text.push_str(delta),
            _ => self.blocks.push(ContentBlock::Text {
                text: delta.to_string(),
            }),
        }
        TurnUpdate::TextDelta {
            delta: delta.to_string(),
            accumulated: self.text.clone(),
        }
    }

    fn push_thinking(&mut self, delta: &str) -> TurnUpdate {
        self.thinking.push_str(delta);
        match self.blocks.last_mut() {
            Some(ContentBlock::Thinking { thinking }) => thinking.push_str(delta),
            _ => self.blocks.push(ContentBlock::Thinking {
                thinking: delta.to_string(),
            }),
        }
        TurnUpdate::ThinkingDelta {
            delta: delta.to_string(),
            accumulated: self.thinking.clone(),
        }
    }

    /// Register a tool call or refresh its input.
    fn observe_tool(
        &mut self,
        id: &str,
        name: &str,
        input: &Value,
        status: ToolStatus,
    ) -> Option<TurnUpdate> {
        if let Some(existing) = self.tools.get_mut(id) {
            let input_changed = !input.is_null() && !is_empty_object(input) && existing.input != *input;
            if !input_changed {
                return None;
            }
            existing.input = input.clone();
            if existing.status == ToolStatus::Pending {
                existing.status = ToolStatus::InProgress;
            }
            let snapshot = existing.clone();
            self.set_block_input(id, input);
            return Some(TurnUpdate::ToolUpdate(snapshot));
        }

        let registration = ToolRegistration {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
            status,
        };
        self.tools.insert(id.to_string(), registration.clone());
        self.tool_order.push(id.to_string());
        self.blocks.push(ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        });
        Some(TurnUpdate::ToolStart(registration))
    }

    fn set_block_input(&mut self, id: &str, input: &Value) {
        for block in &mut self.blocks {
            if let ContentBlock::ToolUse {
                id: block_id,
                input: block_input,
                ..
            } = block
            {
                if block_id == id {
                    *block_input = input.clone();
                }
            }
        }
    }

    fn observe_result(&mut self, tool_use_id: &str, content: &Value, is_error: bool) -> TurnUpdate {
        let status = if is_error {
            ToolStatus::Failed
        } else {
            ToolStatus::Completed
        };
        let registration = if let Some(existing) = self.tools.get_mut(tool_use_id) {
            existing.status = status;
            existing.clone()
        } else {
            tracing::debug!(tool_use_id, "Tool result for a call that was never started");
            ToolRegistration {
                id: tool_use_id.to_string(),
                name: UNKNOWN_TOOL.to_string(),
                input: Value::Null,
                status,
            }
        };
        self.blocks.push(ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            name: registration.name.clone(),
            content: tool_result_text(content),
            is_error,
        });
        TurnUpdate::ToolUpdate(registration)
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(serde_json::Map::is_empty)
}

/// Owns the current turn, the turn counter and the cumulative spend.
#[derive(Debug)]
pub struct TurnAccumulator {
    next_number: u64,
    current: Option<Turn>,
    waiter: Option<oneshot::Sender<TurnResult>>,
    total_cost_usd: f64,
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_number: 1,
            current: None,
            waiter: None,
            total_cost_usd: 0.0,
        }
    }

    /// Begin a new turn and return its number.
    ///
    /// `waiter`, if given, receives the turn's result. The caller is
    /// responsible for checking that no turn is in flight.
    pub fn start_turn(&mut self, waiter: Option<oneshot::Sender<TurnResult>>) -> u64 {
        let number = self.next_number;
        self.next_number += 1;
        self.current = Some(Turn::new(number));
        self.waiter = waiter;
        tracing::debug!(turn = number, "Turn started");
        number
    }

    #[must_use]
    pub fn current(&self) -> Option<&Turn> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd
    }

    /// Append a text fragment to the current turn.
    pub fn apply_text(&mut self, delta: &str) -> Option<TurnUpdate> {
        let turn = self.current.as_mut()?;
        (!delta.is_empty()).then(|| turn.push_text(delta))
    }

    /// Append a thinking fragment to the current turn.
    pub fn apply_thinking(&mut self, delta: &str) -> Option<TurnUpdate> {
        let turn = self.current.as_mut()?;
        (!delta.is_empty()).then(|| turn.push_thinking(delta))
    }

    /// Fold a complete assistant message.
    ///
    /// Text and thinking already seen as partial deltas are not appended
    /// again.
    pub fn apply_assistant(&mut self, message: &AssistantMessage) -> Vec<TurnUpdate> {
        let Some(turn) = self.current.as_mut() else {
            return Vec::new();
        };
        let mut updates = Vec::new();
        for block in &message.message.content {
            match block {
                WireBlock::Text { text } if !turn.saw_partial && !text.is_empty() => {
                    updates.push(turn.push_text(text));
                }
                WireBlock::Thinking { thinking, .. } if !turn.saw_partial && !thinking.is_empty() => {
                    updates.push(turn.push_thinking(thinking));
                }
                WireBlock::ToolUse { id, name, input } => {
                    updates.extend(turn.observe_tool(id, name, input, ToolStatus::InProgress));
                }
                WireBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => updates.push(turn.observe_result(tool_use_id, content, *is_error)),
                _ => {}
            }
        }
        updates
    }

    /// Fold a user message; only tool results matter.
    pub fn apply_user(&mut self, message: &UserMessage) -> Vec<TurnUpdate> {
        let Some(turn) = self.current.as_mut() else {
            return Vec::new();
        };
        let UserContent::Blocks(ref blocks) = message.message.content else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter_map(|block| match block {
                WireBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(turn.observe_result(tool_use_id, content, *is_error)),
                _ => None,
            })
            .collect()
    }

    /// Fold a partial streaming event.
    pub fn apply_stream_event(&mut self, event: &StreamEvent) -> Vec<TurnUpdate> {
        let Some(turn) = self.current.as_mut() else {
            return Vec::new();
        };
        match &event.event {
            StreamEventBody::ContentBlockStart {
                index,
                content_block,
            } => {
                turn.saw_partial = true;
                match content_block {
                    WireBlock::ToolUse { id, name, input } => {
                        turn.partial_inputs.insert(
                            *index,
                            PartialToolInput {
                                id: id.clone(),
                                json: String::new(),
                            },
                        );
                        turn.observe_tool(id, name, input, ToolStatus::Pending)
                            .into_iter()
                            .collect()
                    }
                    WireBlock::Text { text } if !text.is_empty() => vec![turn.push_text(text)],
                    WireBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                        vec![turn.push_thinking(thinking)]
                    }
                    _ => Vec::new(),
                }
            }
            StreamEventBody::ContentBlockDelta { index, delta } => {
                turn.saw_partial = true;
                match delta {
                    ContentDelta::TextDelta { text } if !text.is_empty() => {
                        vec![turn.push_text(text)]
                    }
                    ContentDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                        vec![turn.push_thinking(thinking)]
                    }
                    ContentDelta::InputJsonDelta { partial_json } => {
                        if let Some(partial) = turn.partial_inputs.get_mut(index) {
                            partial.json.push_str(partial_json);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            StreamEventBody::ContentBlockStop { index } => {
                let Some(partial) = turn.partial_inputs.remove(index) else {
                    return Vec::new();
                };
                let input = if partial.json.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    match serde_json::from_str::<Value>(&partial.json) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(tool_use_id = %partial.id, error = %e, "Unparseable streamed tool input");
                            return Vec::new();
                        }
                    }
                };
                let Some(existing) = turn.tools.get_mut(&partial.id) else {
                    return Vec::new();
                };
                existing.input = input.clone();
                existing.status = ToolStatus::InProgress;
                let snapshot = existing.clone();
                turn.set_block_input(&partial.id, &input);
                vec![TurnUpdate::ToolUpdate(snapshot)]
            }
            StreamEventBody::Other => Vec::new(),
        }
    }

    /// Finish the current turn with the agent's result.
    ///
    /// A peer error is offered to `recovery` first. Guardrails are only
    /// evaluated when the agent reported no error. The result is handed to
    /// the waiter registered at `start_turn`, if it is still listening.
    pub fn complete(
        &mut self,
        result: &ResultMessage,
        recovery: &dyn RecoveryPolicy,
        guardrails: &Guardrails,
    ) -> Option<TurnResult> {
        let turn = self.current.take()?;
        let cost_usd = result.total_cost_usd.unwrap_or(0.0);
        self.total_cost_usd += cost_usd;

        let (success, error, recovered) = match TurnError::from_result(result) {
            Some(err) if recovery.is_recoverable(&err, &turn.activity()) => {
                tracing::info!(turn = turn.number, error = %err, "Recovered turn error after streamed activity");
                (true, None, true)
            }
            Some(err) => (false, Some(err), false),
            None => match guardrails.check(turn.number, self.total_cost_usd) {
                Some(violation) => {
                    tracing::warn!(turn = turn.number, %violation, "Guardrail tripped");
                    (false, Some(TurnError::Guardrail(violation)), false)
                }
                None => (true, None, false),
            },
        };

        let duration = if result.duration_ms > 0 {
            Duration::from_millis(result.duration_ms)
        } else {
            turn.elapsed()
        };

        let tools = turn.tools_in_order();
        let outcome = TurnResult {
            number: turn.number,
            success,
            duration,
            usage: result.usage,
            cost_usd,
            text: turn.text,
            thinking: turn.thinking,
            blocks: turn.blocks,
            tools,
            error,
            recovered,
            result_text: result.result.clone(),
        };
        self.deliver(&outcome);
        Some(outcome)
    }

    /// End the current turn without a result.
    pub fn abandon(&mut self, error: TurnError) -> Option<TurnResult> {
        let turn = self.current.take()?;
        tracing::debug!(turn = turn.number, %error, "Turn abandoned");
        let duration = turn.elapsed();
        let tools = turn.tools_in_order();
        let outcome = TurnResult {
            number: turn.number,
            success: false,
            duration,
            usage: crate::wire::Usage::default(),
            cost_usd: 0.0,
            text: turn.text,
            thinking: turn.thinking,
            blocks: turn.blocks,
            tools,
            error: Some(error),
            recovered: false,
            result_text: None,
        };
        self.deliver(&outcome);
        Some(outcome)
    }

    fn deliver(&mut self, outcome: &TurnResult) {
        if let Some(tx) = self.waiter.take() {
            if tx.send(outcome.clone()).is_err() {
                tracing::debug!(turn = outcome.number, "Turn waiter gone, result only in events");
            }
        }
    }
}
