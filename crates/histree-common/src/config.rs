//! Configuration structures for history trees.

use crate::error::{Result, StateHistoryError};
use serde::{Deserialize, Serialize};

/// Default node (block) size in bytes (64 KB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default maximum number of children per core node.
pub const DEFAULT_MAX_CHILDREN: usize = 50;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Largest accepted block size (page offsets are computed in u64, lengths stored in u32).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Bytes of block space budgeted per child slot when bounding `max_children`.
const BYTES_PER_CHILD_BUDGET: usize = 64;

/// Configuration of a history tree, fixed at creation and stored in the file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTreeConfig {
    /// Size of one node page in bytes.
    pub block_size: usize,
    /// Maximum number of children of a core node.
    pub max_children: usize,
    /// Version of the analysis that produced the tree. A reader expecting a
    /// different version rejects the file.
    pub provider_version: u32,
    /// Sync the file to stable storage when the tree is closed.
    pub fsync_on_close: bool,
}

impl Default for HistoryTreeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            provider_version: 0,
            fsync_on_close: true,
        }
    }
}

impl HistoryTreeConfig {
    /// Creates a configuration with the given block size and fan-out.
    pub fn new(block_size: usize, max_children: usize) -> Self {
        Self {
            block_size,
            max_children,
            ..Default::default()
        }
    }

    /// Checks that the block size and fan-out describe a usable tree.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(StateHistoryError::Config(format!(
                "block_size {} outside [{}, {}]",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.max_children < 2 {
            return Err(StateHistoryError::Config(format!(
                "max_children must be at least 2, got {}",
                self.max_children
            )));
        }
        let max_allowed = self.block_size / BYTES_PER_CHILD_BUDGET;
        if self.max_children > max_allowed {
            return Err(StateHistoryError::Config(format!(
                "max_children {} too large for block_size {} (max {})",
                self.max_children, self.block_size, max_allowed
            )));
        }
        Ok(())
    }
}
