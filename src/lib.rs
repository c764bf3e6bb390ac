//! Agent Session - drive a coding agent over its stream-json protocol.
//!
//! A [`Session`] spawns the agent, runs the initialize handshake, and then
//! multiplexes conversation turns, control requests, host tool calls, and
//! permission asks over the agent's stdio.

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod host;
pub mod permission;
pub mod session;
pub mod tools;
pub mod turn;
pub mod wire;

pub use config::SessionConfig;
pub use error::{ErrorCategory, SessionError};
pub use session::{
    EventStream, Session, SessionBuilder, SessionEvent, SessionMetadata, SessionState,
};
pub use tools::{ToolEntry, ToolOutput};
pub use turn::{TurnError, TurnResult};
pub use wire::UserInput;
