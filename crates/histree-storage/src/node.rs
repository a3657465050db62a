//! History tree nodes (leaf and core) and their page format.
//!
//! ## Page layout
//!
//! ```text
//! +--------------------------+ 0
//! | kind: u8                 |
//! | flags: u8 (bit 0 sealed) |
//! | reserved: u16            |
//! | seq: u32                 |
//! | parent: u32              |  u32::MAX = root
//! | start: i64               |
//! | end: i64                 |
//! | interval_count: u32      |
//! | child_count: u32         |
//! | data_len: u32            |
//! | checksum: u32            |  CRC32 of the page with this field zeroed
//! | reserved: u32            |
//! +--------------------------+ 48 (NODE_HEADER_SIZE)
//! | children (core only)     |
//! | [seq:4, start:8] * n     |
//! +--------------------------+ 48 + 12 * n
//! | packed intervals         |  data_len bytes
//! +--------------------------+
//! | zero padding             |
//! +--------------------------+ block_size
//! ```
//!
//! Core nodes budget `max_children` child slots up front, so registering a new
//! child never competes with intervals for space.

use histree_common::{HistoryTreeConfig, Interval, Quark, Result, StateHistoryError, Timestamp};

/// Size of the node header in bytes.
pub const NODE_HEADER_SIZE: usize = 48;

/// Size of one child entry (seq + start) in bytes.
pub const CHILD_ENTRY_SIZE: usize = 12;

/// Parent sequence number stored for the root.
pub const NO_PARENT: u32 = u32::MAX;

const OFF_KIND: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_SEQ: usize = 4;
const OFF_PARENT: usize = 8;
const OFF_START: usize = 12;
const OFF_END: usize = 20;
const OFF_INTERVAL_COUNT: usize = 28;
const OFF_CHILD_COUNT: usize = 32;
const OFF_DATA_LEN: usize = 36;
const OFF_CHECKSUM: usize = 40;

const FLAG_SEALED: u8 = 0b0000_0001;

/// Node type tag stored in the first byte of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Core = 1,
    Leaf = 2,
}

impl NodeType {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(NodeType::Core),
            2 => Some(NodeType::Leaf),
            _ => None,
        }
    }
}

/// Pointer from a core node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    pub seq: u32,
    pub start: Timestamp,
}

/// Node-kind specific data.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Leaf,
    Core { children: Vec<ChildEntry> },
}

/// A page-sized container of intervals.
///
/// Intervals are kept sorted by end time so that queries can skip every
/// interval ending before the queried time with one binary search.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    seq: u32,
    parent: Option<u32>,
    start: Timestamp,
    end: Timestamp,
    sealed: bool,
    intervals: Vec<Interval>,
    kind: NodeKind,
    block_size: usize,
    max_children: usize,
    /// Serialized size of `intervals`.
    data_len: usize,
}

impl Node {
    fn new(seq: u32, parent: Option<u32>, start: Timestamp, kind: NodeKind, config: &HistoryTreeConfig) -> Self {
        Self {
            seq,
            parent,
            start,
            end: start,
            sealed: false,
            intervals: Vec::new(),
            kind,
            block_size: config.block_size,
            max_children: config.max_children,
            data_len: 0,
        }
    }

    /// Creates an open, empty leaf node.
    pub fn new_leaf(seq: u32, parent: Option<u32>, start: Timestamp, config: &HistoryTreeConfig) -> Self {
        Self::new(seq, parent, start, NodeKind::Leaf, config)
    }

    /// Creates an open, empty core node.
    pub fn new_core(seq: u32, parent: Option<u32>, start: Timestamp, config: &HistoryTreeConfig) -> Self {
        Self::new(
            seq,
            parent,
            start,
            NodeKind::Core {
                children: Vec::with_capacity(config.max_children),
            },
            config,
        )
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    #[inline]
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    /// Re-parents a node; only done to the old root when the tree grows.
    pub(crate) fn set_parent(&mut self, parent: u32) {
        debug_assert!(!self.sealed, "cannot re-parent sealed node {}", self.seq);
        self.parent = Some(parent);
    }

    #[inline]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// End time of a sealed node. For an open node, the end of its latest interval.
    #[inline]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Leaf => NodeType::Leaf,
            NodeKind::Core { .. } => NodeType::Core,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Intervals stored in this node, sorted by end time.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Child entries, empty for leaves.
    pub fn children(&self) -> &[ChildEntry] {
        match &self.kind {
            NodeKind::Leaf => &[],
            NodeKind::Core { children } => children,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Bytes reserved for child entries.
    fn children_budget(&self) -> usize {
        match self.kind {
            NodeKind::Leaf => 0,
            NodeKind::Core { .. } => self.max_children * CHILD_ENTRY_SIZE,
        }
    }

    /// Space consumed by header, child budget and intervals.
    pub fn used_size(&self) -> usize {
        NODE_HEADER_SIZE + self.children_budget() + self.data_len
    }

    /// Space left for intervals.
    pub fn free_space(&self) -> usize {
        self.block_size.saturating_sub(self.used_size())
    }

    /// Percentage of the block holding data.
    pub fn usage_percent(&self) -> f64 {
        (NODE_HEADER_SIZE + self.child_count() * CHILD_ENTRY_SIZE + self.data_len) as f64 * 100.0
            / self.block_size as f64
    }

    /// Largest interval an empty node of the smallest capacity can hold.
    pub fn max_interval_size(config: &HistoryTreeConfig) -> usize {
        config
            .block_size
            .saturating_sub(NODE_HEADER_SIZE + config.max_children * CHILD_ENTRY_SIZE)
    }

    /// Returns true if `interval` fits in the remaining space.
    #[inline]
    pub fn has_room_for(&self, interval: &Interval) -> bool {
        !self.sealed && interval.size_on_disk() <= self.free_space()
    }

    /// Adds an interval, keeping intervals sorted by end time.
    ///
    /// Returns `NodeFull` if the serialized node would exceed the block size.
    pub fn try_add_interval(&mut self, interval: Interval) -> Result<()> {
        if !self.has_room_for(&interval) {
            return Err(StateHistoryError::NodeFull);
        }
        debug_assert!(
            interval.start() >= self.start,
            "interval starting at {} stored in node {} starting at {}",
            interval.start(),
            self.seq,
            self.start
        );

        self.data_len += interval.size_on_disk();
        self.end = self.end.max(interval.end());
        // Equal ends keep insertion order
        let pos = self
            .intervals
            .partition_point(|existing| existing.end() <= interval.end());
        self.intervals.insert(pos, interval);
        Ok(())
    }

    /// Registers a new rightmost child.
    ///
    /// Returns `NodeFull` when the node already has `max_children` children.
    /// Panics if called on a leaf.
    pub fn add_child(&mut self, seq: u32, start: Timestamp) -> Result<()> {
        let max_children = self.max_children;
        match &mut self.kind {
            NodeKind::Leaf => panic!("add_child called on leaf node {}", self.seq),
            NodeKind::Core { children } => {
                if children.len() >= max_children {
                    return Err(StateHistoryError::NodeFull);
                }
                debug_assert!(children.last().map_or(true, |c| c.start <= start));
                children.push(ChildEntry { seq, start });
                Ok(())
            }
        }
    }

    /// Returns true if another child can be registered.
    pub fn has_room_for_child(&self) -> bool {
        match &self.kind {
            NodeKind::Leaf => false,
            NodeKind::Core { children } => children.len() < self.max_children,
        }
    }

    /// Fixes the end time and makes the node immutable.
    pub fn seal(&mut self, end: Timestamp) {
        debug_assert!(!self.sealed, "node {} sealed twice", self.seq);
        self.end = end;
        self.sealed = true;
    }

    /// Index of the child whose time range contains `t`.
    pub fn child_index_at(&self, t: Timestamp) -> Option<usize> {
        let children = self.children();
        let idx = children.partition_point(|child| child.start <= t);
        idx.checked_sub(1)
    }

    /// Child whose time range contains `t`.
    pub fn child_at(&self, t: Timestamp) -> Option<ChildEntry> {
        self.child_index_at(t).map(|idx| self.children()[idx])
    }

    /// End of the range covered by child `idx`.
    ///
    /// The last child of an open node extends to `open_end` (the tree end).
    pub fn child_end(&self, idx: usize, open_end: Timestamp) -> Timestamp {
        let children = self.children();
        match children.get(idx + 1) {
            Some(next) => next.start - 1,
            None if self.sealed => self.end,
            None => open_end,
        }
    }

    /// Index of the first interval that can still contain `t`.
    #[inline]
    fn first_ending_at_or_after(&self, t: Timestamp) -> usize {
        self.intervals.partition_point(|interval| interval.end() < t)
    }

    /// Interval of `quark` containing `t`, preferring the latest start on shared endpoints.
    pub fn find_interval(&self, t: Timestamp, quark: Quark) -> Option<&Interval> {
        let from = self.first_ending_at_or_after(t);
        self.intervals[from..]
            .iter()
            .filter(|interval| interval.attribute() == quark && interval.start() <= t)
            .max_by_key(|interval| interval.start())
    }

    /// Every interval containing `t`.
    pub fn intervals_at(&self, t: Timestamp) -> impl Iterator<Item = &Interval> {
        let from = self.first_ending_at_or_after(t);
        self.intervals[from..]
            .iter()
            .filter(move |interval| interval.start() <= t)
    }

    /// Every interval overlapping `[t1, t2]`.
    pub fn intervals_overlapping(&self, t1: Timestamp, t2: Timestamp) -> impl Iterator<Item = &Interval> {
        let from = self.first_ending_at_or_after(t1);
        self.intervals[from..]
            .iter()
            .filter(move |interval| interval.start() <= t2)
    }

    /// Serializes the node into a page of exactly `block_size` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size];
        let children = self.children();

        buf[OFF_KIND] = self.node_type() as u8;
        buf[OFF_FLAGS] = if self.sealed { FLAG_SEALED } else { 0 };
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_le_bytes());
        buf[OFF_PARENT..OFF_PARENT + 4]
            .copy_from_slice(&self.parent.unwrap_or(NO_PARENT).to_le_bytes());
        buf[OFF_START..OFF_START + 8].copy_from_slice(&self.start.to_le_bytes());
        buf[OFF_END..OFF_END + 8].copy_from_slice(&self.end.to_le_bytes());
        buf[OFF_INTERVAL_COUNT..OFF_INTERVAL_COUNT + 4]
            .copy_from_slice(&(self.intervals.len() as u32).to_le_bytes());
        buf[OFF_CHILD_COUNT..OFF_CHILD_COUNT + 4]
            .copy_from_slice(&(children.len() as u32).to_le_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&(self.data_len as u32).to_le_bytes());

        let mut offset = NODE_HEADER_SIZE;
        for child in children {
            buf[offset..offset + 4].copy_from_slice(&child.seq.to_le_bytes());
            buf[offset + 4..offset + 12].copy_from_slice(&child.start.to_le_bytes());
            offset += CHILD_ENTRY_SIZE;
        }

        for interval in &self.intervals {
            offset += interval.encode_into(&mut buf[offset..]);
        }

        let checksum = crc32fast::hash(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserializes a node from a page written by `to_bytes`.
    pub fn from_bytes(buf: &[u8], config: &HistoryTreeConfig) -> Result<Self> {
        if buf.len() != config.block_size {
            return Err(StateHistoryError::Format(format!(
                "node page of {} bytes, expected {}",
                buf.len(),
                config.block_size
            )));
        }

        let seq = read_u32(buf, OFF_SEQ);
        let stored_checksum = read_u32(buf, OFF_CHECKSUM);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..OFF_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&buf[OFF_CHECKSUM + 4..]);
        if hasher.finalize() != stored_checksum {
            return Err(StateHistoryError::Format(format!(
                "checksum mismatch in node {}",
                seq
            )));
        }

        let node_type = NodeType::from_u8(buf[OFF_KIND]).ok_or_else(|| {
            StateHistoryError::Format(format!("invalid node type {} in node {}", buf[OFF_KIND], seq))
        })?;
        let sealed = buf[OFF_FLAGS] & FLAG_SEALED != 0;
        let parent = match read_u32(buf, OFF_PARENT) {
            NO_PARENT => None,
            p => Some(p),
        };
        let start = read_i64(buf, OFF_START);
        let end = read_i64(buf, OFF_END);
        let interval_count = read_u32(buf, OFF_INTERVAL_COUNT) as usize;
        let child_count = read_u32(buf, OFF_CHILD_COUNT) as usize;
        let data_len = read_u32(buf, OFF_DATA_LEN) as usize;

        if node_type == NodeType::Leaf && child_count != 0 {
            return Err(StateHistoryError::Format(format!(
                "leaf node {} claims {} children",
                seq, child_count
            )));
        }
        if child_count > config.max_children {
            return Err(StateHistoryError::Format(format!(
                "node {} has {} children (max {})",
                seq, child_count, config.max_children
            )));
        }

        let children_end = NODE_HEADER_SIZE + child_count * CHILD_ENTRY_SIZE;
        let data_end = children_end + data_len;
        if data_end > buf.len() {
            return Err(StateHistoryError::Format(format!(
                "node {} data overruns page ({} > {})",
                seq,
                data_end,
                buf.len()
            )));
        }

        // Every encoded interval takes at least its fixed fields
        if interval_count > data_len / Interval::FIXED_SIZE {
            return Err(StateHistoryError::Format(format!(
                "node {} claims {} intervals in {} data bytes",
                seq, interval_count, data_len
            )));
        }

        let kind = match node_type {
            NodeType::Leaf => NodeKind::Leaf,
            NodeType::Core => {
                let mut children = Vec::with_capacity(config.max_children);
                for i in 0..child_count {
                    let offset = NODE_HEADER_SIZE + i * CHILD_ENTRY_SIZE;
                    children.push(ChildEntry {
                        seq: read_u32(buf, offset),
                        start: read_i64(buf, offset + 4),
                    });
                }
                NodeKind::Core { children }
            }
        };

        let mut intervals = Vec::with_capacity(interval_count);
        let mut offset = children_end;
        for _ in 0..interval_count {
            let (interval, consumed) = Interval::decode(&buf[offset..data_end])?;
            offset += consumed;
            intervals.push(interval);
        }
        if offset != data_end {
            return Err(StateHistoryError::Format(format!(
                "node {} decoded {} data bytes, header says {}",
                seq,
                offset - children_end,
                data_len
            )));
        }

        Ok(Self {
            seq,
            parent,
            start,
            end,
            sealed,
            intervals,
            kind,
            block_size: config.block_size,
            max_children: config.max_children,
            data_len,
        })
    }
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use histree_common::StateValue;

    fn config() -> HistoryTreeConfig {
        HistoryTreeConfig::new(4096, 8)
    }

    fn interval(attr: Quark, start: Timestamp, end: Timestamp, value: StateValue) -> Interval {
        Interval::new(attr, start, end, value).unwrap()
    }

    #[test]
    fn test_new_leaf() {
        let node = Node::new_leaf(0, None, 100, &config());
        assert_eq!(node.seq(), 0);
        assert_eq!(node.parent(), None);
        assert_eq!(node.start(), 100);
        assert!(node.is_leaf());
        assert!(!node.is_sealed());
        assert_eq!(node.used_size(), NODE_HEADER_SIZE);
        assert_eq!(node.free_space(), 4096 - NODE_HEADER_SIZE);
        assert!(node.children().is_empty());
    }

    #[test]
    fn test_new_core_reserves_children() {
        let node = Node::new_core(1, Some(0), 0, &config());
        assert_eq!(node.node_type(), NodeType::Core);
        assert_eq!(node.used_size(), NODE_HEADER_SIZE + 8 * CHILD_ENTRY_SIZE);
        assert_eq!(
            Node::max_interval_size(&config()),
            4096 - NODE_HEADER_SIZE - 8 * CHILD_ENTRY_SIZE
        );
    }

    #[test]
    fn test_intervals_sorted_by_end() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        node.try_add_interval(interval(1, 0, 30, StateValue::Int(1))).unwrap();
        node.try_add_interval(interval(2, 5, 10, StateValue::Int(2))).unwrap();
        node.try_add_interval(interval(3, 0, 20, StateValue::Int(3))).unwrap();
        node.try_add_interval(interval(4, 11, 20, StateValue::Int(4))).unwrap();

        let ends: Vec<_> = node.intervals().iter().map(|i| i.end()).collect();
        assert_eq!(ends, vec![10, 20, 20, 30]);
        // Equal ends keep insertion order
        assert_eq!(node.intervals()[1].attribute(), 3);
        assert_eq!(node.intervals()[2].attribute(), 4);
        assert_eq!(node.end(), 30);
    }

    #[test]
    fn test_try_add_interval_node_full() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        let mut added = 0;
        loop {
            let iv = interval(added, added as i64, added as i64 + 1, StateValue::Long(added as i64));
            match node.try_add_interval(iv) {
                Ok(()) => added += 1,
                Err(StateHistoryError::NodeFull) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        // 20 fixed bytes + tag + i64 payload
        assert_eq!(added as usize, (4096 - NODE_HEADER_SIZE) / 29);
        assert!(node.free_space() < 29);
        assert!(node.used_size() <= 4096);
    }

    #[test]
    fn test_sealed_node_rejects_intervals() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        node.seal(50);
        assert!(node.is_sealed());
        assert_eq!(node.end(), 50);
        assert!(matches!(
            node.try_add_interval(interval(0, 1, 2, StateValue::Null)),
            Err(StateHistoryError::NodeFull)
        ));
    }

    #[test]
    fn test_add_child_limit() {
        let mut node = Node::new_core(0, None, 0, &config());
        for i in 0..8 {
            assert!(node.has_room_for_child());
            node.add_child(i + 1, i as i64 * 100).unwrap();
        }
        assert!(!node.has_room_for_child());
        assert!(matches!(node.add_child(99, 900), Err(StateHistoryError::NodeFull)));
        assert_eq!(node.child_count(), 8);
    }

    #[test]
    #[should_panic(expected = "add_child called on leaf")]
    fn test_add_child_on_leaf_panics() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        let _ = node.add_child(1, 0);
    }

    #[test]
    fn test_child_lookup() {
        let mut node = Node::new_core(0, None, 0, &config());
        node.add_child(1, 0).unwrap();
        node.add_child(2, 100).unwrap();
        node.add_child(3, 250).unwrap();

        assert_eq!(node.child_at(0).map(|c| c.seq), Some(1));
        assert_eq!(node.child_at(99).map(|c| c.seq), Some(1));
        assert_eq!(node.child_at(100).map(|c| c.seq), Some(2));
        assert_eq!(node.child_at(249).map(|c| c.seq), Some(2));
        assert_eq!(node.child_at(10_000).map(|c| c.seq), Some(3));
        assert_eq!(node.child_at(-1), None);

        assert_eq!(node.child_end(0, 500), 99);
        assert_eq!(node.child_end(1, 500), 249);
        assert_eq!(node.child_end(2, 500), 500);
        node.seal(400);
        assert_eq!(node.child_end(2, 500), 400);
    }

    #[test]
    fn test_find_interval() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        node.try_add_interval(interval(1, 0, 9, StateValue::from("A"))).unwrap();
        node.try_add_interval(interval(1, 10, 25, StateValue::from("B"))).unwrap();
        node.try_add_interval(interval(2, 0, 25, StateValue::Int(42))).unwrap();

        assert_eq!(node.find_interval(5, 1).unwrap().value(), &StateValue::from("A"));
        assert_eq!(node.find_interval(10, 1).unwrap().value(), &StateValue::from("B"));
        assert_eq!(node.find_interval(20, 2).unwrap().value(), &StateValue::Int(42));
        assert!(node.find_interval(26, 1).is_none());
        assert!(node.find_interval(5, 3).is_none());
    }

    #[test]
    fn test_find_interval_shared_endpoint_prefers_latest() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        node.try_add_interval(interval(1, 0, 10, StateValue::from("A"))).unwrap();
        node.try_add_interval(interval(1, 10, 25, StateValue::from("B"))).unwrap();
        assert_eq!(node.find_interval(10, 1).unwrap().value(), &StateValue::from("B"));
    }

    #[test]
    fn test_intervals_at_and_overlapping() {
        let mut node = Node::new_leaf(0, None, 0, &config());
        node.try_add_interval(interval(1, 0, 9, StateValue::Int(1))).unwrap();
        node.try_add_interval(interval(2, 5, 15, StateValue::Int(2))).unwrap();
        node.try_add_interval(interval(3, 20, 30, StateValue::Int(3))).unwrap();

        let at: Vec<_> = node.intervals_at(7).map(|i| i.attribute()).collect();
        assert_eq!(at, vec![1, 2]);

        let overlapping: Vec<_> = node
            .intervals_overlapping(10, 20)
            .map(|i| i.attribute())
            .collect();
        assert_eq!(overlapping, vec![2, 3]);
    }

    #[test]
    fn test_leaf_roundtrip() {
        let cfg = config();
        let mut node = Node::new_leaf(5, Some(2), 1000, &cfg);
        node.try_add_interval(interval(1, 1000, 1010, StateValue::Null)).unwrap();
        node.try_add_interval(interval(2, 1001, 1020, StateValue::Int(-3))).unwrap();
        node.try_add_interval(interval(3, 1005, 1030, StateValue::Double(2.5))).unwrap();
        node.try_add_interval(interval(4, 1009, 1040, StateValue::from("RUN"))).unwrap();
        node.seal(1050);

        let bytes = node.to_bytes();
        assert_eq!(bytes.len(), 4096);
        let decoded = Node::from_bytes(&bytes, &cfg).unwrap();
        assert_eq!(decoded, node);
        // Byte-for-byte stable
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn test_core_roundtrip() {
        let cfg = config();
        let mut node = Node::new_core(0, None, 0, &cfg);
        node.add_child(1, 0).unwrap();
        node.add_child(7, 300).unwrap();
        node.try_add_interval(interval(9, 0, 400, StateValue::Long(1 << 40))).unwrap();

        let decoded = Node::from_bytes(&node.to_bytes(), &cfg).unwrap();
        assert_eq!(decoded, node);
        assert!(!decoded.is_sealed());
        assert_eq!(decoded.children().len(), 2);
    }

    #[test]
    fn test_from_bytes_detects_corruption() {
        let cfg = config();
        let mut node = Node::new_leaf(3, None, 0, &cfg);
        node.try_add_interval(interval(1, 0, 5, StateValue::Int(1))).unwrap();
        let mut bytes = node.to_bytes();
        bytes[NODE_HEADER_SIZE + 2] ^= 0xff;

        let err = Node::from_bytes(&bytes, &cfg).unwrap_err();
        assert!(matches!(err, StateHistoryError::Format(_)));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_from_bytes_rejects_inflated_interval_count() {
        let cfg = config();
        let mut node = Node::new_leaf(4, None, 0, &cfg);
        node.try_add_interval(interval(1, 0, 5, StateValue::Int(1))).unwrap();
        let mut bytes = node.to_bytes();
        bytes[OFF_INTERVAL_COUNT..OFF_INTERVAL_COUNT + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        // Re-sign the page so only the count is wrong
        bytes[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
        let checksum = crc32fast::hash(&bytes);
        bytes[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());

        let err = Node::from_bytes(&bytes, &cfg).unwrap_err();
        assert!(matches!(err, StateHistoryError::Format(_)));
        assert!(err.to_string().contains("claims"));
    }

    #[test]
    fn test_from_bytes_rejects_wrong_size() {
        let cfg = config();
        let node = Node::new_leaf(0, None, 0, &cfg);
        let bytes = node.to_bytes();
        assert!(Node::from_bytes(&bytes[..1024], &cfg).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_zeroed_page() {
        let cfg = config();
        let zeroed = vec![0u8; 4096];
        assert!(matches!(
            Node::from_bytes(&zeroed, &cfg),
            Err(StateHistoryError::Format(_))
        ));
    }

    #[test]
    fn test_usage_percent() {
        let cfg = config();
        let node = Node::new_leaf(0, None, 0, &cfg);
        let expected = NODE_HEADER_SIZE as f64 * 100.0 / 4096.0;
        assert!((node.usage_percent() - expected).abs() < 1e-9);
    }
}
