//! The history tree: a single-writer, many-reader interval store.
//!
//! Intervals are appended to the open leaf of the active branch, the chain of
//! open nodes from the root down to the most recent leaf. When a node fills up
//! the branch is split: the full node and everything below it are sealed at
//! the current tree end and written to the node store, and fresh open nodes
//! starting just after the split time take their place. Sealed nodes are
//! never modified again.
//!
//! Intervals that start before the open leaf (long-lived states) are stored in
//! the deepest ancestor whose start precedes them, so every node on a
//! root-to-leaf path may hold data.

use crate::disk::HistoryFile;
use crate::header::TreeHeader;
use crate::node::Node;
use crate::range::OverlapIter;
use crate::store::NodeStore;
use histree_buffer::{CacheStats, NodeCacheConfig};
use histree_common::{
    HistoryTreeConfig, Interval, Quark, Result, StateHistoryError, StateValue, Timestamp,
};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Mutable tree state, guarded by the tree's lock.
struct TreeState {
    tree_start: Timestamp,
    tree_end: Timestamp,
    node_count: u32,
    root_seq: u32,
    depth: usize,
    /// Open nodes from the root (index 0) to the current leaf. Empty once closed.
    branch: Vec<Node>,
    /// End of the latest interval inserted for each attribute.
    last_end: HashMap<Quark, Timestamp>,
    closed: bool,
    /// Location of the attribute blob, if one was stored.
    attributes: Option<(u64, u64)>,
}

impl TreeState {
    fn check_time(&self, t: Timestamp) -> Result<()> {
        if t < self.tree_start || t > self.tree_end {
            return Err(StateHistoryError::time_range(
                t,
                t,
                format!(
                    "query outside the tree range [{}, {}]",
                    self.tree_start, self.tree_end
                ),
            ));
        }
        Ok(())
    }

    /// Fails once a walk has reached more nodes than the tree holds, which
    /// only a cycle of child links can cause.
    pub(crate) fn check_visits(&self, visited: usize, seq: u32) -> Result<()> {
        check_visits(visited, self.node_count, seq)
    }

    fn allocate_seq(&mut self) -> u32 {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }
}

pub(crate) fn check_visits(visited: usize, node_count: u32, seq: u32) -> Result<()> {
    if visited > node_count as usize {
        return Err(StateHistoryError::Format(format!(
            "node {} reached through a cycle of child links",
            seq
        )));
    }
    Ok(())
}

/// A node reached during a query, either from the active branch or the store.
enum NodeRef<'a> {
    Open(&'a Node),
    Sealed(Arc<Node>),
}

impl Deref for NodeRef<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            NodeRef::Open(node) => node,
            NodeRef::Sealed(node) => node,
        }
    }
}

/// Summary statistics of a history tree.
#[derive(Debug, Clone)]
pub struct TreeStats {
    pub depth: usize,
    pub node_count: u32,
    pub tree_start: Timestamp,
    pub tree_end: Timestamp,
    pub file_size: u64,
    /// Average share of each node's block holding data, in percent.
    pub average_node_usage: f64,
    pub cache: CacheStats,
}

/// Disk-resident history tree.
///
/// `HistoryTree` is `Send + Sync`; share it with `Arc` to query from several
/// threads while one thread inserts.
pub struct HistoryTree {
    config: HistoryTreeConfig,
    store: NodeStore,
    state: RwLock<TreeState>,
}

impl HistoryTree {
    /// Creates a new, empty tree at `path` whose history begins at `tree_start`.
    pub fn create(path: impl AsRef<Path>, config: HistoryTreeConfig, tree_start: Timestamp) -> Result<Self> {
        Self::create_with(path, config, NodeCacheConfig::default(), tree_start)
    }

    /// Creates a new tree with an explicit node cache configuration.
    pub fn create_with(
        path: impl AsRef<Path>,
        config: HistoryTreeConfig,
        cache_config: NodeCacheConfig,
        tree_start: Timestamp,
    ) -> Result<Self> {
        config.validate()?;
        let file = HistoryFile::create(path, config.block_size)?;
        // Left unclosed until close_tree rewrites it
        file.write_header(&TreeHeader::new(&config, tree_start))?;

        info!(
            path = %file.path().display(),
            block_size = config.block_size,
            max_children = config.max_children,
            tree_start,
            "created history tree"
        );

        let root = Node::new_leaf(0, None, tree_start, &config);
        let state = TreeState {
            tree_start,
            tree_end: tree_start,
            node_count: 1,
            root_seq: 0,
            depth: 1,
            branch: vec![root],
            last_end: HashMap::new(),
            closed: false,
            attributes: None,
        };

        Ok(Self {
            store: NodeStore::new(file, config.clone(), cache_config),
            config,
            state: RwLock::new(state),
        })
    }

    /// Opens a closed tree for querying.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, NodeCacheConfig::default(), None)
    }

    /// Opens a closed tree with an explicit cache configuration.
    ///
    /// When `expected_provider_version` is given, a file built by a different
    /// provider version is rejected with a `Format` error.
    pub fn open_with(
        path: impl AsRef<Path>,
        cache_config: NodeCacheConfig,
        expected_provider_version: Option<u32>,
    ) -> Result<Self> {
        let (file, header) = HistoryFile::open(path)?;

        if !header.is_closed() {
            return Err(StateHistoryError::Format(
                "history file was not closed properly".to_string(),
            ));
        }
        if let Some(expected) = expected_provider_version {
            if header.provider_version != expected {
                return Err(StateHistoryError::Format(format!(
                    "provider version {} does not match expected version {}",
                    header.provider_version, expected
                )));
            }
        }
        let config = header.config();
        config.validate()?;
        if header.node_count == 0 || header.root_seq >= header.node_count {
            return Err(StateHistoryError::Format(format!(
                "root node {} out of {} nodes",
                header.root_seq, header.node_count
            )));
        }
        let nodes_end = file.page_offset(header.node_count);
        if file.len()? < nodes_end {
            return Err(StateHistoryError::Format(format!(
                "file truncated: {} nodes need {} bytes",
                header.node_count, nodes_end
            )));
        }

        let store = NodeStore::new(file, config.clone(), cache_config);

        // Walk the leftmost path: validates the root and yields the depth
        let mut depth = 1;
        let mut node = store.read_node(header.root_seq)?;
        while let Some(child) = node.children().first().copied() {
            depth += 1;
            check_visits(depth, header.node_count, child.seq)?;
            node = store.read_node(child.seq)?;
        }

        info!(
            path = %store.file().path().display(),
            nodes = header.node_count,
            depth,
            tree_start = header.tree_start,
            tree_end = header.tree_end,
            "opened history tree"
        );

        let attributes = (header.attribute_size > 0)
            .then_some((header.attribute_offset, header.attribute_size));
        let state = TreeState {
            tree_start: header.tree_start,
            tree_end: header.tree_end,
            node_count: header.node_count,
            root_seq: header.root_seq,
            depth,
            branch: Vec::new(),
            last_end: HashMap::new(),
            closed: true,
            attributes,
        };

        Ok(Self {
            config,
            store,
            state: RwLock::new(state),
        })
    }

    /// Returns the tree configuration.
    pub fn config(&self) -> &HistoryTreeConfig {
        &self.config
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        self.store.file().path()
    }

    pub(crate) fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn tree_start(&self) -> Timestamp {
        self.state.read().tree_start
    }

    /// Largest end time inserted so far, or the close time once closed.
    pub fn tree_end(&self) -> Timestamp {
        self.state.read().tree_end
    }

    pub fn node_count(&self) -> u32 {
        self.state.read().node_count
    }

    /// Number of levels, 1 for a tree made of a single leaf.
    pub fn depth(&self) -> usize {
        self.state.read().depth
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Builds an interval and inserts it. See [`HistoryTree::insert`].
    pub fn insert_interval(
        &self,
        attribute: Quark,
        start: Timestamp,
        end: Timestamp,
        value: StateValue,
    ) -> Result<()> {
        self.insert(Interval::new(attribute, start, end, value)?)
    }

    /// Inserts an interval.
    ///
    /// # Errors
    ///
    /// `TimeRange` if the interval starts before the tree start,
    /// `IntervalTooLarge` if it cannot fit in an empty node and `TreeClosed`
    /// after [`HistoryTree::close_tree`].
    ///
    /// # Panics
    ///
    /// Panics if the interval starts before the end of the previous interval
    /// inserted for the same attribute. Intervals of one attribute must arrive
    /// in order; they may share an endpoint.
    pub fn insert(&self, interval: Interval) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StateHistoryError::TreeClosed);
        }
        if interval.start() < state.tree_start {
            return Err(StateHistoryError::time_range(
                interval.start(),
                interval.end(),
                format!("interval starts before the tree start {}", state.tree_start),
            ));
        }
        let size = interval.size_on_disk();
        let max = Node::max_interval_size(&self.config);
        if size > max {
            return Err(StateHistoryError::IntervalTooLarge { size, max });
        }
        if let Some(&previous_end) = state.last_end.get(&interval.attribute()) {
            assert!(
                interval.start() >= previous_end,
                "interval [{}, {}] of attribute {} overlaps the previous interval ending at {}",
                interval.start(),
                interval.end(),
                interval.attribute(),
                previous_end
            );
        }

        let attribute = interval.attribute();
        let end = interval.end();
        self.insert_in_branch(&mut state, interval)?;

        state.tree_end = state.tree_end.max(end);
        state.last_end.insert(attribute, end);
        Ok(())
    }

    fn insert_in_branch(&self, state: &mut TreeState, interval: Interval) -> Result<()> {
        let mut level = state.branch.len() - 1;
        loop {
            let node = &mut state.branch[level];
            if interval.start() < node.start() {
                // The root starts at the tree start, so this stops at level 0
                level -= 1;
                continue;
            }
            if node.has_room_for(&interval) {
                return node.try_add_interval(interval);
            }
            self.add_sibling(state, level)?;
            level = state.branch.len() - 1;
        }
    }

    /// Replaces the full node at `level` (and every open node below it) with
    /// fresh open nodes starting after the current tree end.
    fn add_sibling(&self, state: &mut TreeState, level: usize) -> Result<()> {
        let split_time = state.tree_end;
        let new_start = split_time.checked_add(1).ok_or_else(|| {
            StateHistoryError::time_range(split_time, split_time, "no room after the maximum timestamp")
        })?;

        let mut attach = level;
        while attach > 0 && !state.branch[attach - 1].has_room_for_child() {
            attach -= 1;
        }
        if attach == 0 {
            return self.add_new_root(state, split_time, new_start);
        }

        let leaf_depth = state.branch.len() - 1;
        self.write_sealed(&state.branch[attach..], split_time)?;
        state.branch.truncate(attach);
        for depth in attach..=leaf_depth {
            let node = self.new_open_node(state, depth == leaf_depth, new_start)?;
            state.branch.push(node);
        }

        debug!(
            level = attach,
            split_time,
            nodes = state.node_count,
            "split active branch"
        );
        Ok(())
    }

    /// Grows the tree by one level. The new root's children are the old root
    /// and a fresh branch starting at `new_start`.
    fn add_new_root(&self, state: &mut TreeState, split_time: Timestamp, new_start: Timestamp) -> Result<()> {
        let old_depth = state.branch.len();
        // Nothing is allocated or re-parented until the old branch is written
        let root_seq = state.node_count;
        let mut old_branch = state.branch.clone();
        old_branch[0].set_parent(root_seq);
        self.write_sealed(&old_branch, split_time)?;
        state.allocate_seq();

        let (old_seq, old_start) = (old_branch[0].seq(), old_branch[0].start());
        let mut root = Node::new_core(root_seq, None, state.tree_start, &self.config);
        root.add_child(old_seq, old_start)?;

        state.branch.clear();
        state.branch.push(root);
        state.root_seq = root_seq;
        for depth in 1..=old_depth {
            let node = self.new_open_node(state, depth == old_depth, new_start)?;
            state.branch.push(node);
        }
        state.depth = state.branch.len();

        info!(
            depth = state.depth,
            root = root_seq,
            split_time,
            "history tree grew a new root"
        );
        Ok(())
    }

    /// Creates an open node below the deepest node of the branch and registers it there.
    fn new_open_node(&self, state: &mut TreeState, leaf: bool, start: Timestamp) -> Result<Node> {
        let seq = state.allocate_seq();
        let parent = state.branch.last_mut();
        let parent_seq = parent.as_ref().map(|p| p.seq());
        if let Some(parent) = parent {
            parent.add_child(seq, start)?;
        }
        Ok(if leaf {
            Node::new_leaf(seq, parent_seq, start, &self.config)
        } else {
            Node::new_core(seq, parent_seq, start, &self.config)
        })
    }

    /// Seals copies of `nodes` at `end` and writes them to the store.
    ///
    /// The open originals are left untouched, so a failed write keeps the
    /// branch consistent.
    fn write_sealed(&self, nodes: &[Node], end: Timestamp) -> Result<()> {
        for node in nodes {
            let mut sealed = node.clone();
            sealed.seal(end);
            self.store.write_node(sealed)?;
        }
        Ok(())
    }

    /// Seals the active branch at `max(end, tree_end)` and finalizes the file.
    ///
    /// Returns `TreeClosed` if the tree is already closed.
    pub fn close_tree(&self, end: Timestamp) -> Result<()> {
        self.close_inner(end, None)
    }

    /// Closes the tree and stores `attributes` after the last node page.
    pub fn close_tree_with_attributes(&self, end: Timestamp, attributes: &[u8]) -> Result<()> {
        self.close_inner(end, Some(attributes))
    }

    fn close_inner(&self, end: Timestamp, attributes: Option<&[u8]>) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StateHistoryError::TreeClosed);
        }

        let end = end.max(state.tree_end);
        self.write_sealed(&state.branch, end)?;

        let file = self.store.file();
        let mut header = TreeHeader::new(&self.config, state.tree_start);
        header.node_count = state.node_count;
        header.root_seq = state.root_seq;
        header.tree_end = end;
        if let Some(blob) = attributes {
            let offset = file.page_offset(state.node_count);
            file.write_blob(offset, blob)?;
            header.attribute_offset = offset;
            header.attribute_size = blob.len() as u64;
        }
        header.flags |= TreeHeader::FLAG_CLOSED;
        header.seal();

        // Pages reach the disk before the header marks the file complete
        if self.config.fsync_on_close {
            file.sync()?;
        }
        file.write_header(&header)?;
        if self.config.fsync_on_close {
            file.sync()?;
        }

        state.branch.clear();
        state.tree_end = end;
        state.closed = true;
        state.attributes = attributes.map(|_| (header.attribute_offset, header.attribute_size));

        info!(
            path = %file.path().display(),
            nodes = state.node_count,
            depth = state.depth,
            tree_end = end,
            "closed history tree"
        );
        Ok(())
    }

    /// Reads the attribute blob stored at close, if any.
    pub fn read_attribute_blob(&self) -> Result<Option<Vec<u8>>> {
        let location = self.state.read().attributes;
        match location {
            Some((offset, size)) => self.store.file().read_blob(offset, size).map(Some),
            None => Ok(None),
        }
    }

    fn node_ref<'a>(&self, state: &'a TreeState, seq: u32) -> Result<NodeRef<'a>> {
        if let Some(node) = state.branch.iter().find(|node| node.seq() == seq) {
            return Ok(NodeRef::Open(node));
        }
        self.store.read_node(seq).map(NodeRef::Sealed)
    }

    /// Visits every node on the path from the root to the leaf covering `t`.
    fn for_each_on_path(
        &self,
        state: &TreeState,
        t: Timestamp,
        mut visit: impl FnMut(&Node),
    ) -> Result<()> {
        let mut node = self.node_ref(state, state.root_seq)?;
        let mut visited = 1;
        loop {
            visit(&node);
            let Some(child) = node.child_at(t) else {
                return Ok(());
            };
            visited += 1;
            state.check_visits(visited, child.seq)?;
            node = self.node_ref(state, child.seq)?;
        }
    }

    /// Returns the interval of `quark` containing `t`.
    ///
    /// When no interval was recorded the result is a null interval `[t, t]`.
    /// On a shared endpoint the interval starting latest wins.
    pub fn query_state_at(&self, t: Timestamp, quark: Quark) -> Result<Interval> {
        let state = self.state.read();
        state.check_time(t)?;

        let mut best: Option<Interval> = None;
        self.for_each_on_path(&state, t, |node| {
            if let Some(found) = node.find_interval(t, quark) {
                if best.as_ref().map_or(true, |b| found.start() > b.start()) {
                    best = Some(found.clone());
                }
            }
        })?;

        Ok(best.unwrap_or_else(|| Interval::null(quark, t, t)))
    }

    /// Returns every interval containing `t`, indexed by quark.
    ///
    /// The vector extends to the largest quark found; quarks without an
    /// interval at `t` are `None`.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<Option<Interval>>> {
        let state = self.state.read();
        state.check_time(t)?;

        let mut full: Vec<Option<Interval>> = Vec::new();
        self.for_each_on_path(&state, t, |node| {
            for interval in node.intervals_at(t) {
                let idx = interval.attribute() as usize;
                if idx >= full.len() {
                    full.resize(idx + 1, None);
                }
                let slot = &mut full[idx];
                if slot.as_ref().map_or(true, |b| interval.start() > b.start()) {
                    *slot = Some(interval.clone());
                }
            }
        })?;

        Ok(full)
    }

    /// Returns a lazy iterator over the intervals of `quark` overlapping
    /// `[t1, t2]`, in start order.
    ///
    /// The iterator sees the tree as it was when this method returned.
    pub fn query_intervals_overlapping(
        &self,
        t1: Timestamp,
        t2: Timestamp,
        quark: Quark,
    ) -> Result<OverlapIter<'_>> {
        if t1 > t2 {
            return Err(StateHistoryError::time_range(t1, t2, "range start after range end"));
        }
        let state = self.state.read();
        let snapshot = state
            .branch
            .iter()
            .map(|node| Arc::new(node.clone()))
            .collect();
        Ok(OverlapIter::new(
            self,
            snapshot,
            state.node_count,
            state.root_seq,
            state.tree_start,
            state.tree_end,
            t1,
            t2,
            quark,
        ))
    }

    /// Collects the intervals of any of `quarks` overlapping `[t1, t2]`.
    ///
    /// Nodes are visited cache-first, so the result is unordered.
    pub fn query_2d(&self, t1: Timestamp, t2: Timestamp, quarks: &[Quark]) -> Result<Vec<Interval>> {
        if t1 > t2 {
            return Err(StateHistoryError::time_range(t1, t2, "range start after range end"));
        }
        let state = self.state.read();
        let mut results = Vec::new();
        if quarks.is_empty() || t2 < state.tree_start || t1 > state.tree_end {
            return Ok(results);
        }

        let mut queue = VecDeque::from([state.root_seq]);
        let mut visited = 0;
        while !queue.is_empty() {
            let open = queue
                .iter()
                .position(|seq| state.branch.iter().any(|node| node.seq() == *seq));
            let node = match open {
                Some(pos) => match queue.remove(pos) {
                    Some(seq) => self.node_ref(&state, seq)?,
                    None => break,
                },
                None => match self.store.read_node_prioritized(&mut queue)? {
                    Some(node) => NodeRef::Sealed(node),
                    None => break,
                },
            };

            visited += 1;
            state.check_visits(visited, node.seq())?;

            results.extend(
                node.intervals_overlapping(t1, t2)
                    .filter(|interval| quarks.contains(&interval.attribute()))
                    .cloned(),
            );
            for (idx, child) in node.children().iter().enumerate() {
                if child.start <= t2 && node.child_end(idx, state.tree_end) >= t1 {
                    queue.push_back(child.seq);
                }
            }
        }
        Ok(results)
    }

    /// Computes summary statistics. Visits every node to measure usage.
    pub fn stats(&self) -> Result<TreeStats> {
        let state = self.state.read();
        let mut usage = 0.0;
        for seq in 0..state.node_count {
            usage += self.node_ref(&state, seq)?.usage_percent();
        }

        Ok(TreeStats {
            depth: state.depth,
            node_count: state.node_count,
            tree_start: state.tree_start,
            tree_end: state.tree_end,
            file_size: self.store.file().len()?,
            average_node_usage: usage / state.node_count as f64,
            cache: self.store.cache_stats(),
        })
    }

    /// Closes the tree handle and deletes its file.
    pub fn delete_file(self) -> Result<()> {
        info!(path = %self.path().display(), "deleting history file");
        self.store.delete()
    }
}

impl std::fmt::Debug for HistoryTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("HistoryTree")
            .field("path", &self.store.file().path())
            .field("tree_start", &state.tree_start)
            .field("tree_end", &state.tree_end)
            .field("node_count", &state.node_count)
            .field("depth", &state.depth)
            .field("closed", &state.closed)
            .finish()
    }
}
