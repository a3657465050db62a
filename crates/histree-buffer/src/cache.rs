//! Bounded cache of sealed nodes keyed by sequence number.

use crate::frame::{CacheFrame, FrameId};
use crate::replacer::{ReplacementPolicy, Replacer};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::trace;

/// Configuration for the node cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCacheConfig {
    /// Number of nodes kept in memory.
    pub capacity: usize,
    /// Replacement policy used when the cache is full.
    pub policy: ReplacementPolicy,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            policy: ReplacementPolicy::Lru,
        }
    }
}

impl NodeCacheConfig {
    /// Smallest capacity chosen by `auto_sized`.
    const MIN_AUTO_CAPACITY: usize = 64;
    /// Largest capacity chosen by `auto_sized`.
    const MAX_AUTO_CAPACITY: usize = 65_536;

    /// Sizes the cache to 1/16 of available system RAM for nodes of `block_size` bytes.
    ///
    /// Bounded to [64, 65536] nodes, so a tree never pins gigabytes on large
    /// machines or thrashes on tiny ones.
    pub fn auto_sized(block_size: usize) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 16;
        let capacity = (target_bytes / block_size.max(1))
            .clamp(Self::MIN_AUTO_CAPACITY, Self::MAX_AUTO_CAPACITY);

        Self {
            capacity,
            ..Default::default()
        }
    }
}

/// Statistics about the node cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of frames.
    pub capacity: usize,
    /// Number of frames holding a node.
    pub cached: usize,
    /// Lookups answered from memory.
    pub hits: u64,
    /// Lookups that had to go to disk.
    pub misses: u64,
    /// Nodes dropped to make room.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups answered from memory.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Node cache.
///
/// Manages a fixed-size array of frames with:
/// - Sequence number to frame ID mapping behind a read-write lock
/// - Free frame list for new nodes
/// - Pluggable replacement for eviction
///
/// Readers hold the table read lock while cloning a node handle, writers hold
/// the write lock while moving a node in or out of a frame, so a frame is
/// never observed half-replaced.
pub struct NodeCache<T> {
    config: NodeCacheConfig,
    frames: Vec<CacheFrame<T>>,
    table: RwLock<HashMap<u32, FrameId>>,
    free_list: Mutex<Vec<FrameId>>,
    replacer: Box<dyn Replacer>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T> NodeCache<T> {
    /// Creates a new cache. A capacity of zero is raised to one frame.
    pub fn new(config: NodeCacheConfig) -> Self {
        let num_frames = config.capacity.max(1);

        let frames: Vec<_> = (0..num_frames)
            .map(|i| CacheFrame::new(FrameId(i as u32)))
            .collect();

        // Pop from the back so frame 0 is handed out first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            replacer: config.policy.build(num_frames),
            config: NodeCacheConfig {
                capacity: num_frames,
                ..config
            },
            frames,
            table: RwLock::new(HashMap::with_capacity(num_frames)),
            free_list: Mutex::new(free_list),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the number of frames.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Returns the number of cached nodes.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a node is cached, without counting as an access.
    pub fn contains(&self, seq: u32) -> bool {
        self.table.read().contains_key(&seq)
    }

    /// Looks up a node, recording a hit or a miss.
    #[inline]
    pub fn get(&self, seq: u32) -> Option<Arc<T>> {
        let found = {
            let table = self.table.read();
            table
                .get(&seq)
                .and_then(|frame_id| self.frames[frame_id.0 as usize].get(seq).map(|n| (*frame_id, n)))
        };

        match found {
            Some((frame_id, node)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.replacer.record_access(frame_id);
                Some(node)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Allocates a frame, evicting if necessary. Caller holds the table write lock.
    ///
    /// Returns the frame and the sequence number of the node it held.
    fn allocate_frame(&self, table: &mut HashMap<u32, FrameId>) -> Option<(FrameId, Option<u32>)> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Some((frame_id, None));
        }

        let victim_id = self.replacer.evict()?;
        let evicted = self.frames[victim_id.0 as usize].reset();
        if let Some(old_seq) = evicted {
            table.remove(&old_seq);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(seq = old_seq, frame = %victim_id, "evicted node from cache");
        }
        Some((victim_id, evicted))
    }

    /// Inserts a node, replacing any node cached under the same sequence number.
    ///
    /// Returns the sequence number of the node evicted to make room, if any.
    pub fn insert(&self, seq: u32, node: Arc<T>) -> Option<u32> {
        let mut table = self.table.write();

        if let Some(&frame_id) = table.get(&seq) {
            self.frames[frame_id.0 as usize].store(seq, node);
            self.replacer.record_access(frame_id);
            return None;
        }

        let (frame_id, evicted) = self.allocate_frame(&mut table)?;
        self.frames[frame_id.0 as usize].store(seq, node);
        table.insert(seq, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, true);

        evicted
    }

    /// Drops every cached node.
    pub fn clear(&self) {
        let mut table = self.table.write();
        let mut free_list = self.free_list.lock();
        for (_, frame_id) in table.drain() {
            self.replacer.remove(frame_id);
            self.frames[frame_id.0 as usize].reset();
            free_list.push(frame_id);
        }
    }

    /// Returns statistics about the cache.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.config.capacity,
            cached: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replacer::ReplacementPolicy;

    fn cache(capacity: usize) -> NodeCache<String> {
        NodeCache::new(NodeCacheConfig {
            capacity,
            policy: ReplacementPolicy::Lru,
        })
    }

    fn node(seq: u32) -> Arc<String> {
        Arc::new(format!("node-{}", seq))
    }

    #[test]
    fn test_cache_new() {
        let cache = cache(8);
        assert_eq!(cache.capacity(), 8);
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_zero_capacity_raised() {
        let cache = cache(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(1, node(1));
        assert!(cache.contains(1));
    }

    #[test]
    fn test_cache_insert_get() {
        let cache = cache(4);
        assert_eq!(cache.insert(3, node(3)), None);
        assert_eq!(cache.get(3).as_deref().map(String::as_str), Some("node-3"));
        assert!(cache.get(4).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached, 1);
    }

    #[test]
    fn test_cache_insert_existing_replaces() {
        let cache = cache(2);
        cache.insert(1, node(1));
        cache.insert(1, Arc::new("updated".to_string()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1).as_deref().map(String::as_str), Some("updated"));
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = cache(3);
        cache.insert(0, node(0));
        cache.insert(1, node(1));
        cache.insert(2, node(2));

        // Touch 0 so 1 is least recently used
        assert!(cache.get(0).is_some());

        assert_eq!(cache.insert(3, node(3)), Some(1));
        assert!(!cache.contains(1));
        assert!(cache.contains(0));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_clock_eviction() {
        let cache: NodeCache<String> = NodeCache::new(NodeCacheConfig {
            capacity: 2,
            policy: ReplacementPolicy::Clock,
        });
        cache.insert(10, node(10));
        cache.insert(11, node(11));
        let evicted = cache.insert(12, node(12));
        assert!(matches!(evicted, Some(10) | Some(11)));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(12));
    }

    #[test]
    fn test_cache_eviction_keeps_handles_alive() {
        let cache = cache(1);
        cache.insert(1, node(1));
        let handle = cache.get(1).unwrap();
        cache.insert(2, node(2));
        assert!(!cache.contains(1));
        assert_eq!(handle.as_str(), "node-1");
    }

    #[test]
    fn test_cache_clear() {
        let cache = cache(4);
        for seq in 0..4 {
            cache.insert(seq, node(seq));
        }
        cache.clear();
        assert!(cache.is_empty());
        for seq in 10..14 {
            assert_eq!(cache.insert(seq, node(seq)), None);
        }
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let cache = cache(4);
        assert_eq!(cache.stats().hit_rate(), 0.0);
        cache.insert(1, node(1));
        cache.get(1);
        cache.get(1);
        cache.get(1);
        cache.get(2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_concurrent_readers() {
        let cache = Arc::new(cache(16));
        for seq in 0..16 {
            cache.insert(seq, node(seq));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for round in 0..1000u32 {
                        let seq = round % 16;
                        let n = cache.get(seq).unwrap();
                        assert_eq!(*n, format!("node-{}", seq));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.stats().hits, 4000);
    }

    #[test]
    fn test_auto_sized_bounds() {
        let config = NodeCacheConfig::auto_sized(64 * 1024);
        assert!(config.capacity >= 64);
        assert!(config.capacity <= 65_536);
        assert_eq!(config.policy, ReplacementPolicy::Lru);
    }
}
