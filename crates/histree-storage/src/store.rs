//! Node store: sealed node pages on disk behind a shared node cache.

use crate::disk::HistoryFile;
use crate::node::Node;
use histree_buffer::{CacheStats, NodeCache, NodeCacheConfig};
use histree_common::{HistoryTreeConfig, Result, StateHistoryError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Number of failed reads of one page after which the page is reported as
/// corrupt without touching the file again.
const MAX_READ_FAILURES: u32 = 3;

/// Persists sealed nodes and serves them back through an LRU cache.
///
/// Sealed nodes are immutable, so a cached `Arc<Node>` stays valid for as long
/// as any reader holds it.
pub struct NodeStore {
    file: HistoryFile,
    cache: NodeCache<Node>,
    config: HistoryTreeConfig,
    /// Consecutive read failures per node.
    failures: Mutex<HashMap<u32, u32>>,
}

impl NodeStore {
    /// Wraps an already opened history file.
    pub fn new(file: HistoryFile, config: HistoryTreeConfig, cache_config: NodeCacheConfig) -> Self {
        debug!(
            path = %file.path().display(),
            capacity = cache_config.capacity,
            "node store ready"
        );
        Self {
            file,
            cache: NodeCache::new(cache_config),
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the underlying file.
    pub fn file(&self) -> &HistoryFile {
        &self.file
    }

    /// Returns the tree configuration pages are decoded with.
    pub fn config(&self) -> &HistoryTreeConfig {
        &self.config
    }

    /// Writes a sealed node to its page and caches it.
    ///
    /// Each node is written exactly once, when it is sealed.
    pub fn write_node(&self, node: Node) -> Result<Arc<Node>> {
        debug_assert!(node.is_sealed(), "writing open node {}", node.seq());
        let seq = node.seq();
        self.file.write_page(seq, &node.to_bytes())?;
        trace!(seq, start = node.start(), end = node.end(), "node written");

        let node = Arc::new(node);
        if let Some(evicted) = self.cache.insert(seq, Arc::clone(&node)) {
            trace!(seq = evicted, "node evicted from cache");
        }
        Ok(node)
    }

    /// Returns node `seq`, from the cache when possible.
    pub fn read_node(&self, seq: u32) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get(seq) {
            return Ok(node);
        }

        if self.failures.lock().get(&seq).copied().unwrap_or(0) >= MAX_READ_FAILURES {
            return Err(StateHistoryError::Format(format!(
                "node {} is repeatedly unreadable",
                seq
            )));
        }

        match self.load(seq) {
            Ok(node) => {
                self.failures.lock().remove(&seq);
                let node = Arc::new(node);
                self.cache.insert(seq, Arc::clone(&node));
                Ok(node)
            }
            Err(e) => {
                let mut failures = self.failures.lock();
                let count = failures.entry(seq).or_insert(0);
                *count += 1;
                warn!(seq, attempts = *count, error = %e, "failed to read node");
                Err(e)
            }
        }
    }

    fn load(&self, seq: u32) -> Result<Node> {
        let page = self.file.read_page(seq)?;
        let node = Node::from_bytes(&page, &self.config)?;
        if node.seq() != seq {
            return Err(StateHistoryError::Format(format!(
                "page {} holds node {}",
                seq,
                node.seq()
            )));
        }
        Ok(node)
    }

    /// Reads one node from `queue`, preferring any queued node that is already
    /// cached. The chosen sequence number is removed from the queue.
    ///
    /// Returns `None` when the queue is empty.
    pub fn read_node_prioritized(&self, queue: &mut VecDeque<u32>) -> Result<Option<Arc<Node>>> {
        let position = queue.iter().position(|seq| self.cache.contains(*seq));
        let seq = match position {
            Some(pos) => queue.remove(pos),
            None => queue.pop_front(),
        };
        match seq {
            Some(seq) => self.read_node(seq).map(Some),
            None => Ok(None),
        }
    }

    /// Returns true if node `seq` is cached.
    pub fn contains_cached(&self, seq: u32) -> bool {
        self.cache.contains(seq)
    }

    /// Returns cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drops every cached node.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Consumes the store and deletes its file.
    pub fn delete(self) -> Result<()> {
        let Self { file, cache, .. } = self;
        cache.clear();
        file.delete()
    }
}
