//! Lazy range queries.

use crate::node::Node;
use crate::tree::{check_visits, HistoryTree};
use histree_common::{Interval, Quark, Result, StateHistoryError, Timestamp};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::trace;

/// Cooperative cancellation for long-running queries.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every query holding this flag.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

/// Heap entry ordering intervals by start, then end, then attribute.
#[derive(Debug, Clone)]
struct ByStart(Interval);

impl ByStart {
    fn key(&self) -> (Timestamp, Timestamp, Quark) {
        (self.0.start(), self.0.end(), self.0.attribute())
    }
}

impl PartialEq for ByStart {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ByStart {}

impl PartialOrd for ByStart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByStart {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Iterator over the intervals of one attribute overlapping `[t1, t2]`, in
/// start order.
///
/// Nodes are loaded lazily. Pending nodes are kept in a min-heap keyed by
/// node start, and matching intervals are buffered in a min-heap keyed by
/// interval start. A buffered interval is released once no pending node can
/// contain an interval starting earlier, since every interval in a node (and
/// in its descendants) starts at or after the node start.
///
/// The open nodes of the tree are snapshotted when the iterator is created.
/// Cloning an unstarted iterator yields an independent restart of the query.
#[derive(Clone)]
pub struct OverlapIter<'a> {
    tree: &'a HistoryTree,
    /// Copies of the active branch at creation.
    open_nodes: Vec<Arc<Node>>,
    /// Tree end at creation; bounds the last child of open nodes.
    open_end: Timestamp,
    /// Node count at creation; no query visits more nodes.
    node_count: u32,
    visited: usize,
    t1: Timestamp,
    t2: Timestamp,
    quark: Quark,
    pending: BinaryHeap<Reverse<(Timestamp, u32)>>,
    ready: BinaryHeap<Reverse<ByStart>>,
    cancel: Option<CancellationFlag>,
    done: bool,
}

impl<'a> OverlapIter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tree: &'a HistoryTree,
        open_nodes: Vec<Arc<Node>>,
        node_count: u32,
        root_seq: u32,
        tree_start: Timestamp,
        tree_end: Timestamp,
        t1: Timestamp,
        t2: Timestamp,
        quark: Quark,
    ) -> Self {
        let mut pending = BinaryHeap::new();
        if tree_start <= t2 && t1 <= tree_end {
            pending.push(Reverse((tree_start, root_seq)));
        }
        Self {
            tree,
            open_nodes,
            open_end: tree_end,
            node_count,
            visited: 0,
            t1,
            t2,
            quark,
            pending,
            ready: BinaryHeap::new(),
            cancel: None,
            done: false,
        }
    }

    /// Attaches a cancellation flag, checked before each node is loaded.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn load(&self, seq: u32) -> Result<Arc<Node>> {
        match self.open_nodes.iter().find(|node| node.seq() == seq) {
            Some(node) => Ok(Arc::clone(node)),
            None => self.tree.store().read_node(seq),
        }
    }

    fn visit(&mut self, node: &Node) {
        let (t1, t2, quark) = (self.t1, self.t2, self.quark);
        for interval in node.intervals_overlapping(t1, t2) {
            if interval.attribute() == quark {
                self.ready.push(Reverse(ByStart(interval.clone())));
            }
        }
        for (idx, child) in node.children().iter().enumerate() {
            if child.start <= t2 && node.child_end(idx, self.open_end) >= t1 {
                self.pending.push(Reverse((child.start, child.seq)));
            }
        }
        trace!(
            seq = node.seq(),
            pending = self.pending.len(),
            ready = self.ready.len(),
            "range query visited node"
        );
    }
}

impl Iterator for OverlapIter<'_> {
    type Item = Result<Interval>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let next_node_start = self.pending.peek().map(|Reverse((start, _))| *start);
            if let Some(Reverse(first)) = self.ready.peek() {
                if next_node_start.map_or(true, |start| first.0.start() <= start) {
                    return self.ready.pop().map(|Reverse(ByStart(interval))| Ok(interval));
                }
            }

            let Some(Reverse((_, seq))) = self.pending.pop() else {
                self.done = true;
                return None;
            };
            if self.cancel.as_ref().is_some_and(CancellationFlag::is_cancelled) {
                self.done = true;
                return Some(Err(StateHistoryError::Cancelled));
            }
            self.visited += 1;
            if let Err(e) = check_visits(self.visited, self.node_count, seq) {
                self.done = true;
                return Some(Err(e));
            }
            match self.load(seq) {
                Ok(node) => self.visit(&node),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use histree_common::{HistoryTreeConfig, StateValue};
    use tempfile::tempdir;

    fn build_tree(dir: &tempfile::TempDir) -> HistoryTree {
        let config = HistoryTreeConfig {
            fsync_on_close: false,
            ..HistoryTreeConfig::new(1024, 4)
        };
        let tree = HistoryTree::create(dir.path().join("range.ht"), config, 0).unwrap();
        for i in 0..400i64 {
            let attr = (i % 4) as u32;
            let start = (i / 4) * 10;
            tree.insert_interval(attr, start, start + 9, StateValue::Long(i)).unwrap();
        }
        tree
    }

    fn starts(iter: OverlapIter<'_>) -> Vec<Timestamp> {
        iter.map(|r| r.unwrap().start()).collect()
    }

    #[test]
    fn test_cancellation_flag() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_range_ordered_and_complete() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);

        let found = starts(tree.query_intervals_overlapping(95, 305, 1).unwrap());
        let expected: Vec<_> = (9..=30).map(|k| k * 10).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_range_whole_tree() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);
        let found = starts(tree.query_intervals_overlapping(0, 999, 3).unwrap());
        assert_eq!(found.len(), 100);
        assert!(found.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_range_outside_tree_is_empty() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);
        assert_eq!(tree.query_intervals_overlapping(5000, 6000, 0).unwrap().count(), 0);
    }

    #[test]
    fn test_range_reversed_bounds() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);
        assert!(matches!(
            tree.query_intervals_overlapping(20, 10, 0),
            Err(StateHistoryError::TimeRange { .. })
        ));
    }

    #[test]
    fn test_range_restartable_by_clone() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);
        let iter = tree.query_intervals_overlapping(0, 200, 2).unwrap();
        let again = iter.clone();
        assert_eq!(starts(iter), starts(again));
    }

    #[test]
    fn test_range_snapshot_ignores_later_inserts() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);
        let iter = tree.query_intervals_overlapping(0, 5000, 0).unwrap();
        tree.insert_interval(0, 1000, 1010, StateValue::Long(-1)).unwrap();
        let found = starts(iter);
        assert_eq!(found.len(), 100);
        assert_eq!(
            tree.query_intervals_overlapping(0, 5000, 0).unwrap().count(),
            101
        );
    }

    #[test]
    fn test_range_cancelled() {
        let dir = tempdir().unwrap();
        let tree = build_tree(&dir);
        let flag = CancellationFlag::new();
        flag.cancel();
        let mut iter = tree
            .query_intervals_overlapping(0, 999, 0)
            .unwrap()
            .with_cancellation(flag);
        assert!(matches!(iter.next(), Some(Err(StateHistoryError::Cancelled))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_by_start_ordering() {
        let a = ByStart(Interval::new(0, 5, 10, StateValue::Null).unwrap());
        let b = ByStart(Interval::new(1, 5, 12, StateValue::Null).unwrap());
        let c = ByStart(Interval::new(0, 7, 8, StateValue::Null).unwrap());
        assert!(a < b);
        assert!(b < c);
    }
}
