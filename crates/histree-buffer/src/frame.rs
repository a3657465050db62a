//! Cache frame management.

use parking_lot::RwLock;
use std::sync::Arc;

/// Unique identifier for a frame in the node cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the node cache holding at most one sealed node.
///
/// Nodes are shared as `Arc<T>`: evicting a frame never invalidates a handle
/// that a reader already obtained, so frames need no pin counts.
pub struct CacheFrame<T> {
    frame_id: FrameId,
    slot: RwLock<Option<(u32, Arc<T>)>>,
}

impl<T> CacheFrame<T> {
    /// Creates a new empty frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            slot: RwLock::new(None),
        }
    }

    /// Returns the sequence number of the node held by this frame.
    #[inline]
    pub fn seq(&self) -> Option<u32> {
        self.slot.read().as_ref().map(|(seq, _)| *seq)
    }

    /// Returns the node held by this frame if it has the given sequence number.
    #[inline]
    pub fn get(&self, seq: u32) -> Option<Arc<T>> {
        match self.slot.read().as_ref() {
            Some((held, node)) if *held == seq => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// Stores a node in this frame, returning the previous occupant's sequence number.
    #[inline]
    pub fn store(&self, seq: u32, node: Arc<T>) -> Option<u32> {
        self.slot
            .write()
            .replace((seq, node))
            .map(|(previous, _)| previous)
    }

    /// Empties the frame.
    #[inline]
    pub fn reset(&self) -> Option<u32> {
        self.slot.write().take().map(|(seq, _)| seq)
    }

    /// Returns true if this frame holds no node.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slot.read().is_none()
    }
}

impl<T> std::fmt::Debug for CacheFrame<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFrame")
            .field("frame_id", &self.frame_id)
            .field("seq", &self.seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_display() {
        assert_eq!(FrameId(42).to_string(), "frame:42");
    }

    #[test]
    fn test_frame_new_is_empty() {
        let frame: CacheFrame<String> = CacheFrame::new(FrameId(3));
        assert!(frame.is_empty());
        assert_eq!(frame.seq(), None);
        assert!(frame.get(0).is_none());
    }

    #[test]
    fn test_frame_store_and_get() {
        let frame = CacheFrame::new(FrameId(0));
        assert_eq!(frame.store(7, Arc::new("node-7".to_string())), None);
        assert_eq!(frame.seq(), Some(7));
        assert_eq!(frame.get(7).as_deref().map(String::as_str), Some("node-7"));
        // A different sequence number never matches
        assert!(frame.get(8).is_none());
    }

    #[test]
    fn test_frame_replace_returns_previous() {
        let frame = CacheFrame::new(FrameId(0));
        frame.store(1, Arc::new(1u64));
        assert_eq!(frame.store(2, Arc::new(2u64)), Some(1));
        assert_eq!(frame.seq(), Some(2));
    }

    #[test]
    fn test_frame_reset_keeps_outstanding_handles() {
        let frame = CacheFrame::new(FrameId(0));
        frame.store(5, Arc::new(vec![1u8, 2, 3]));
        let handle = frame.get(5).unwrap();

        assert_eq!(frame.reset(), Some(5));
        assert!(frame.is_empty());
        assert_eq!(*handle, vec![1u8, 2, 3]);
    }

    #[test]
    fn test_frame_debug() {
        let frame = CacheFrame::new(FrameId(1));
        frame.store(9, Arc::new(()));
        let debug = format!("{:?}", frame);
        assert!(debug.contains("frame_id"));
        assert!(debug.contains("Some(9)"));
    }
}
