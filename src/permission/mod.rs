mod gateway;
mod policy;

pub use gateway::*;
pub use policy::*;
