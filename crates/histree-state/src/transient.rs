//! Ongoing (not yet closed) state of every attribute.

use histree_common::{Interval, Quark, Result, StateHistoryError, StateValue, Timestamp};
use histree_storage::HistoryTree;

/// Current value and start time of each attribute while the history is being built.
///
/// A state change closes the previous ongoing interval into the history tree
/// and starts a new one.
#[derive(Debug, Clone)]
pub struct TransientState {
    values: Vec<StateValue>,
    starts: Vec<Timestamp>,
    /// Start time given to attributes created later.
    tree_start: Timestamp,
    /// Latest time seen in any state change.
    latest_time: Timestamp,
    active: bool,
}

impl TransientState {
    /// Creates an active, empty table for a history starting at `tree_start`.
    pub fn new(tree_start: Timestamp) -> Self {
        Self {
            values: Vec::new(),
            starts: Vec::new(),
            tree_start,
            latest_time: tree_start,
            active: true,
        }
    }

    /// Creates an inactive table, as for a history opened from disk.
    pub fn inactive(tree_start: Timestamp) -> Self {
        Self {
            active: false,
            ..Self::new(tree_start)
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn latest_time(&self) -> Timestamp {
        self.latest_time
    }

    /// Grows the table to `count` attributes. New attributes are null since the tree start.
    pub fn ensure_attributes(&mut self, count: usize) {
        if count > self.values.len() {
            self.values.resize(count, StateValue::Null);
            self.starts.resize(count, self.tree_start);
        }
    }

    fn index(&self, quark: Quark) -> Result<usize> {
        let idx = quark as usize;
        if idx < self.values.len() {
            Ok(idx)
        } else {
            Err(StateHistoryError::AttributeNotFound(quark))
        }
    }

    pub fn ongoing_value(&self, quark: Quark) -> Result<&StateValue> {
        Ok(&self.values[self.index(quark)?])
    }

    pub fn ongoing_start(&self, quark: Quark) -> Result<Timestamp> {
        Ok(self.starts[self.index(quark)?])
    }

    /// Returns true if the ongoing state answers a query for `quark` at `t`.
    pub fn covers(&self, t: Timestamp, quark: Quark) -> bool {
        self.active && self.index(quark).map_or(false, |idx| t >= self.starts[idx])
    }

    /// Ongoing interval of `quark`, ending at the latest known time (or at `t`, if later).
    pub fn ongoing_interval(&self, quark: Quark, t: Timestamp) -> Result<Interval> {
        let idx = self.index(quark)?;
        let start = self.starts[idx];
        let end = t.max(self.latest_time).max(start);
        Interval::new(quark, start, end, self.values[idx].clone())
    }

    /// Closes the ongoing interval of `quark` at `t - 1` and starts `value` at `t`.
    ///
    /// No interval is written when `t` equals the ongoing start.
    pub fn process_state_change(
        &mut self,
        t: Timestamp,
        value: StateValue,
        quark: Quark,
        tree: &HistoryTree,
    ) -> Result<()> {
        if !self.active {
            return Err(StateHistoryError::TreeClosed);
        }
        let idx = self.index(quark)?;
        let start = self.starts[idx];
        if t < start {
            return Err(StateHistoryError::time_range(
                t,
                t,
                format!("state change before the ongoing start {} of attribute {}", start, quark),
            ));
        }

        if t > start {
            tree.insert(Interval::new(quark, start, t - 1, self.values[idx].clone())?)?;
        }
        self.values[idx] = value;
        self.starts[idx] = t;
        self.latest_time = self.latest_time.max(t);
        Ok(())
    }

    /// Rewrites the ongoing value of `quark` without closing an interval.
    pub fn update_ongoing_value(&mut self, quark: Quark, value: StateValue) -> Result<()> {
        let idx = self.index(quark)?;
        self.values[idx] = value;
        Ok(())
    }

    /// Closes every ongoing interval at `end` and deactivates the table.
    ///
    /// `end` is raised to the latest known time if needed.
    pub fn close(&mut self, end: Timestamp, tree: &HistoryTree) -> Result<Timestamp> {
        if !self.active {
            return Err(StateHistoryError::TreeClosed);
        }
        let end = end.max(self.latest_time);
        for (idx, value) in self.values.iter().enumerate() {
            tree.insert(Interval::new(idx as Quark, self.starts[idx], end, value.clone())?)?;
        }
        self.active = false;
        self.latest_time = end;
        Ok(end)
    }
}
