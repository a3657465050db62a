//! Disk-resident history tree for histree.
//!
//! This crate provides:
//! - Node pages holding time-stamped attribute intervals
//! - The history file (header, node pages, attribute blob)
//! - A node store serving sealed nodes through the node cache
//! - The history tree with point, full-state and range queries

mod disk;
mod header;
mod node;
mod range;
mod store;
mod tree;

pub use disk::HistoryFile;
pub use header::{TreeHeader, HEADER_REGION_SIZE};
pub use node::{ChildEntry, Node, NodeKind, NodeType, CHILD_ENTRY_SIZE, NODE_HEADER_SIZE, NO_PARENT};
pub use range::{CancellationFlag, OverlapIter};
pub use store::NodeStore;
pub use tree::{HistoryTree, TreeStats};
