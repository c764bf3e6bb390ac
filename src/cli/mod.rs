//! Agent process spawning and stdio line framing.

mod process;
mod stream;

pub use process::*;
pub use stream::*;
