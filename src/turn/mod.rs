mod accumulator;
mod guardrail;
mod recovery;
mod result;

pub use accumulator::*;
pub use guardrail::*;
pub use recovery::*;
pub use result::*;
