mod fs;
mod recorder;
mod terminal;

pub use fs::*;
pub use recorder::*;
pub use terminal::*;
