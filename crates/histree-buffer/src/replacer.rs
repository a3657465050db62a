//! Node replacement policies for the node cache.

use crate::frame::FrameId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Chooses which cache frame gives up its node when the cache is full.
///
/// Frame ids outside the replacer's capacity are ignored.
pub trait Replacer: Send + Sync {
    /// Notes a hit on `frame_id`.
    fn record_access(&self, frame_id: FrameId);

    /// Allows or forbids eviction of `frame_id`.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Picks and forgets a victim, or `None` when nothing can be evicted.
    fn evict(&self) -> Option<FrameId>;

    /// Forgets `frame_id` after its node was dropped from the cache.
    fn remove(&self, frame_id: FrameId);

    /// Number of frames that may currently be evicted.
    fn size(&self) -> usize;
}

/// Replacement policy selected by the cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Clock (second chance).
    Clock,
}

impl ReplacementPolicy {
    /// Builds a replacer of this kind for `num_frames` frames.
    pub fn build(self, num_frames: usize) -> Box<dyn Replacer> {
        match self {
            ReplacementPolicy::Lru => Box::new(LruReplacer::new(num_frames)),
            ReplacementPolicy::Clock => Box::new(ClockReplacer::new(num_frames)),
        }
    }
}

/// Least-recently-used replacement.
///
/// Every access stamps the frame with a monotonically increasing tick. The
/// evictable frames are kept ordered by stamp, so the victim is the first entry.
pub struct LruReplacer {
    inner: Mutex<LruReplacerInner>,
}

struct LruReplacerInner {
    num_frames: usize,
    /// Next access stamp.
    tick: u64,
    /// Last access stamp of each frame.
    stamps: Vec<u64>,
    /// Whether each frame is evictable.
    evictable: Vec<bool>,
    /// Evictable frames ordered by last access.
    order: BTreeMap<u64, FrameId>,
}

impl LruReplacer {
    /// Creates a new LRU replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(LruReplacerInner {
                num_frames,
                tick: 0,
                stamps: vec![0; num_frames],
                evictable: vec![false; num_frames],
                order: BTreeMap::new(),
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().num_frames
    }
}

impl LruReplacerInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl Replacer for LruReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.num_frames {
            return;
        }
        let tick = inner.next_tick();
        let old = std::mem::replace(&mut inner.stamps[idx], tick);
        if inner.evictable[idx] {
            inner.order.remove(&old);
            inner.order.insert(tick, frame_id);
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.num_frames || inner.evictable[idx] == evictable {
            return;
        }
        inner.evictable[idx] = evictable;
        if evictable {
            // Frames never accessed get a fresh stamp so stamps stay unique.
            if inner.stamps[idx] == 0 {
                let tick = inner.next_tick();
                inner.stamps[idx] = tick;
            }
            let stamp = inner.stamps[idx];
            inner.order.insert(stamp, frame_id);
        } else {
            let stamp = inner.stamps[idx];
            inner.order.remove(&stamp);
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let (_, frame_id) = inner.order.pop_first()?;
        inner.evictable[frame_id.0 as usize] = false;
        Some(frame_id)
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.num_frames {
            return;
        }
        if inner.evictable[idx] {
            let stamp = inner.stamps[idx];
            inner.order.remove(&stamp);
            inner.evictable[idx] = false;
        }
        inner.stamps[idx] = 0;
    }

    fn size(&self) -> usize {
        self.inner.lock().order.len()
    }
}

/// Second-chance (clock) replacement.
///
/// A hand sweeps the frames in order. An evictable frame that was accessed
/// since the last sweep loses its reference bit and is skipped once.
pub struct ClockReplacer {
    inner: Mutex<ClockReplacerInner>,
}

#[derive(Clone, Copy, Default)]
struct ClockSlot {
    referenced: bool,
    evictable: bool,
}

struct ClockReplacerInner {
    slots: Vec<ClockSlot>,
    hand: usize,
    evictable_count: usize,
}

impl ClockReplacer {
    /// Creates a clock replacer for `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockReplacerInner {
                slots: vec![ClockSlot::default(); num_frames],
                hand: 0,
                evictable_count: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl ClockReplacerInner {
    fn slot(&mut self, frame_id: FrameId) -> Option<&mut ClockSlot> {
        self.slots.get_mut(frame_id.0 as usize)
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        if let Some(slot) = self.inner.lock().slot(frame_id) {
            slot.referenced = true;
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock();
        let changed = match inner.slot(frame_id) {
            Some(slot) if slot.evictable != evictable => {
                slot.evictable = evictable;
                true
            }
            _ => false,
        };
        if changed {
            if evictable {
                inner.evictable_count += 1;
            } else {
                inner.evictable_count -= 1;
            }
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.evictable_count == 0 {
            return None;
        }

        let num_frames = inner.slots.len();
        // The first sweep clears every reference bit, so two always suffice.
        for _ in 0..(2 * num_frames) {
            let hand = inner.hand;
            inner.hand = (hand + 1) % num_frames;
            let slot = &mut inner.slots[hand];
            if !slot.evictable {
                continue;
            }
            if slot.referenced {
                slot.referenced = false;
            } else {
                slot.evictable = false;
                inner.evictable_count -= 1;
                return Some(FrameId(hand as u32));
            }
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let was_evictable = match inner.slot(frame_id) {
            Some(slot) => std::mem::take(slot).evictable,
            None => false,
        };
        if was_evictable {
            inner.evictable_count -= 1;
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable_count
    }
}
