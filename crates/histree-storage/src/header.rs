//! History file header.

use histree_common::{HistoryTreeConfig, Result, StateHistoryError, Timestamp};

/// Bytes reserved at the start of the file for the header. Node pages follow.
pub const HEADER_REGION_SIZE: u64 = 4096;

/// Header at the beginning of each history file.
///
/// Layout (68 bytes, little-endian):
/// - magic: 4 bytes ("HIST")
/// - version: 4 bytes
/// - provider_version: 4 bytes
/// - block_size: 4 bytes
/// - max_children: 4 bytes
/// - node_count: 4 bytes
/// - root_seq: 4 bytes
/// - flags: 4 bytes
/// - tree_start: 8 bytes
/// - tree_end: 8 bytes
/// - attribute_offset: 8 bytes
/// - attribute_size: 8 bytes
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Version of the analysis that built the tree.
    pub provider_version: u32,
    /// Size of one node page.
    pub block_size: u32,
    /// Fan-out of core nodes.
    pub max_children: u32,
    /// Number of node pages.
    pub node_count: u32,
    /// Sequence number of the root node.
    pub root_seq: u32,
    /// Header flags.
    pub flags: u32,
    pub tree_start: Timestamp,
    pub tree_end: Timestamp,
    /// File offset of the serialized attribute tree.
    pub attribute_offset: u64,
    /// Size of the serialized attribute tree, 0 if absent.
    pub attribute_size: u64,
    /// Header checksum.
    pub checksum: u32,
}

impl TreeHeader {
    /// Magic bytes identifying a history file.
    pub const MAGIC: [u8; 4] = *b"HIST";
    /// Current format version.
    pub const VERSION: u32 = 1;
    /// Size of the header in bytes.
    pub const SIZE: usize = 68;
    /// Set once the tree has been closed and every node written.
    pub const FLAG_CLOSED: u32 = 0x1;

    /// Creates a header for a tree that is still being built.
    pub fn new(config: &HistoryTreeConfig, tree_start: Timestamp) -> Self {
        let mut header = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            provider_version: config.provider_version,
            block_size: config.block_size as u32,
            max_children: config.max_children as u32,
            node_count: 0,
            root_seq: 0,
            flags: 0,
            tree_start,
            tree_end: tree_start,
            attribute_offset: 0,
            attribute_size: 0,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Returns true if the closed flag is set.
    pub fn is_closed(&self) -> bool {
        self.flags & Self::FLAG_CLOSED != 0
    }

    /// Recomputes the checksum after fields were updated.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Tree configuration recorded in the header.
    pub fn config(&self) -> HistoryTreeConfig {
        HistoryTreeConfig {
            block_size: self.block_size as usize,
            max_children: self.max_children as usize,
            provider_version: self.provider_version,
            ..Default::default()
        }
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.encode_fields();
        crc32fast::hash(&bytes[..Self::SIZE - 4])
    }

    fn encode_fields(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.provider_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.max_children.to_le_bytes());
        buf[20..24].copy_from_slice(&self.node_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.root_seq.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
        buf[32..40].copy_from_slice(&self.tree_start.to_le_bytes());
        buf[40..48].copy_from_slice(&self.tree_end.to_le_bytes());
        buf[48..56].copy_from_slice(&self.attribute_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.attribute_size.to_le_bytes());
        buf
    }

    /// Validates magic, version and checksum.
    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(StateHistoryError::Format(
                "invalid magic bytes, not a history file".to_string(),
            ));
        }
        if self.version != Self::VERSION {
            return Err(StateHistoryError::Format(format!(
                "unsupported file version: {}",
                self.version
            )));
        }
        if self.checksum != self.compute_checksum() {
            return Err(StateHistoryError::Format(
                "header checksum mismatch".to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = self.encode_fields();
        buf[64..68].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes a header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(StateHistoryError::Format(format!(
                "truncated file header: {} bytes",
                buf.len()
            )));
        }
        let u32_at = |off: usize| u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        let u64_at = |off: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[off..off + 8]);
            u64::from_le_bytes(bytes)
        };

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);

        Ok(Self {
            magic,
            version: u32_at(4),
            provider_version: u32_at(8),
            block_size: u32_at(12),
            max_children: u32_at(16),
            node_count: u32_at(20),
            root_seq: u32_at(24),
            flags: u32_at(28),
            tree_start: u64_at(32) as i64,
            tree_end: u64_at(40) as i64,
            attribute_offset: u64_at(48),
            attribute_size: u64_at(56),
            checksum: u32_at(64),
        })
    }
}
