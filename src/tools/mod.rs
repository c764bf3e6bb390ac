pub mod jsonrpc;
mod router;

pub use router::*;
