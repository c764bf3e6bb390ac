//! Agent sessions: lifecycle, dispatch, and events.

mod client;
mod events;
mod reader;
mod state;

pub use client::*;
pub use events::*;
pub use state::*;
