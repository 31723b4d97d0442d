//! Deferred graph infrastructure for composing load and transfer nodes.
//!
//! The builder records typed node applications in a valid execution order and enforces that
//! every transfer handle is consumed by exactly one wait. The frozen [`Graph`] runs nodes on the
//! calling thread; only wait nodes block.
mod builder;
mod executor;
mod state;

pub use builder::GraphBuilder;
pub use executor::Graph;
pub use state::{NodeId, ValueId};
