//! Newline-delimited JSON wire format spoken by the agent.

mod codec;
mod messages;

pub use codec::*;
pub use messages::*;
