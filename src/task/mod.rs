pub mod condition;
pub mod exclusivity;
pub mod observer;
pub mod operation;
pub mod queue;
pub mod reachability;
pub mod types;

#[cfg(test)]
mod tests;

pub use condition::*;
pub use exclusivity::*;
pub use observer::*;
pub use operation::*;
pub use queue::*;
pub use reachability::*;
pub use types::*;
