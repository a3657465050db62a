//! State system for histree.
//!
//! Maps attribute paths to quarks, tracks the ongoing state of every
//! attribute while a history is built, and answers state queries over the
//! history tree and the ongoing state together.

mod attribute;
mod system;
mod transient;

pub use attribute::{AttributeTree, ROOT_QUARK, WILDCARD};
pub use system::{QueryLock, StateSystem, MAX_STACK_DEPTH};
pub use transient::TransientState;
