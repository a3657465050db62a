//! Node cache for the history-tree interval store.
//!
//! This crate provides an in-memory cache of sealed tree nodes with:
//! - Fixed capacity in nodes, chosen per instance (never process-global)
//! - LRU or clock replacement
//! - Shared `Arc` handles, so eviction never invalidates a reader's node
//! - Hit, miss and eviction statistics

mod cache;
mod frame;
mod replacer;

pub use cache::{CacheStats, NodeCache, NodeCacheConfig};
pub use frame::{CacheFrame, FrameId};
pub use replacer::{ClockReplacer, LruReplacer, ReplacementPolicy, Replacer};
