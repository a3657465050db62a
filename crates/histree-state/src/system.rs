//! State system: builds a history from state changes and answers queries
//! over both the history tree and the ongoing state.

use crate::attribute::AttributeTree;
use crate::transient::TransientState;
use histree_buffer::NodeCacheConfig;
use histree_common::{
    HistoryTreeConfig, Interval, Quark, Result, StateHistoryError, StateValue, Timestamp,
};
use histree_storage::HistoryTree;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Largest supported depth of a stack attribute.
pub const MAX_STACK_DEPTH: i32 = 100_000;

/// Front end of a history: attribute management, state changes and queries.
///
/// Lock order: attributes, then transient state, then the replaced state.
pub struct StateSystem {
    tree: HistoryTree,
    attributes: RwLock<AttributeTree>,
    transient: RwLock<TransientState>,
    /// Ongoing state set by `replace_ongoing_state`, kept apart from the
    /// builder's table and cleared when the query lock is released.
    replaced: RwLock<HashMap<Quark, Interval>>,
    query_lock: Mutex<()>,
}

/// Exclusive query session returned by [`StateSystem::take_query_lock`].
///
/// Dropping it discards any ongoing state set with
/// [`StateSystem::replace_ongoing_state`].
pub struct QueryLock<'a> {
    system: &'a StateSystem,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for QueryLock<'_> {
    fn drop(&mut self) {
        self.system.replaced.write().clear();
    }
}

impl StateSystem {
    /// Creates a new history at `path` starting at `start`.
    pub fn create(path: impl AsRef<Path>, config: HistoryTreeConfig, start: Timestamp) -> Result<Self> {
        Self::create_with(path, config, NodeCacheConfig::default(), start)
    }

    /// Creates a new history with an explicit node cache configuration.
    pub fn create_with(
        path: impl AsRef<Path>,
        config: HistoryTreeConfig,
        cache_config: NodeCacheConfig,
        start: Timestamp,
    ) -> Result<Self> {
        let tree = HistoryTree::create_with(path, config, cache_config, start)?;
        debug!(path = %tree.path().display(), start, "state system created");
        Ok(Self {
            tree,
            attributes: RwLock::new(AttributeTree::new()),
            transient: RwLock::new(TransientState::new(start)),
            replaced: RwLock::new(HashMap::new()),
            query_lock: Mutex::new(()),
        })
    }

    /// Opens a closed history read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, NodeCacheConfig::default(), None)
    }

    /// Opens a closed history read-only, optionally checking its provider version.
    pub fn open_with(
        path: impl AsRef<Path>,
        cache_config: NodeCacheConfig,
        expected_provider_version: Option<u32>,
    ) -> Result<Self> {
        let tree = HistoryTree::open_with(path, cache_config, expected_provider_version)?;
        let attributes = match tree.read_attribute_blob()? {
            Some(bytes) => AttributeTree::from_bytes(&bytes)?,
            None => {
                warn!(path = %tree.path().display(), "history has no attribute tree");
                AttributeTree::new()
            }
        };
        info!(
            path = %tree.path().display(),
            attributes = attributes.num_attributes(),
            "state system opened"
        );
        let transient = TransientState::inactive(tree.tree_start());
        Ok(Self {
            tree,
            attributes: RwLock::new(attributes),
            transient: RwLock::new(transient),
            replaced: RwLock::new(HashMap::new()),
            query_lock: Mutex::new(()),
        })
    }

    /// Returns the underlying history tree.
    pub fn tree(&self) -> &HistoryTree {
        &self.tree
    }

    pub fn start_time(&self) -> Timestamp {
        self.tree.tree_start()
    }

    /// Latest time known to the tree or to the ongoing state.
    pub fn current_end_time(&self) -> Timestamp {
        self.tree.tree_end().max(self.transient.read().latest_time())
    }

    pub fn num_attributes(&self) -> usize {
        self.attributes.read().num_attributes()
    }

    /// Returns true while state changes are accepted.
    pub fn is_building(&self) -> bool {
        self.transient.read().is_active()
    }

    // -------------------------------------------------------------------------
    // Attributes
    // -------------------------------------------------------------------------

    pub fn get_quark_for_path(&self, path: &[&str]) -> Result<Quark> {
        self.attributes.read().get_quark_for_path(path)
    }

    /// Looks up `path`, creating missing attributes.
    pub fn get_or_add_quark_for_path(&self, path: &[&str]) -> Quark {
        let mut attributes = self.attributes.write();
        let quark = attributes.get_or_add_quark_for_path(path);
        self.transient.write().ensure_attributes(attributes.num_attributes());
        quark
    }

    pub fn get_quark_relative(&self, start: Quark, path: &[&str]) -> Result<Quark> {
        self.attributes.read().get_quark_relative(start, path)
    }

    /// Looks up `path` below `start`, creating missing attributes.
    pub fn get_or_add_quark_relative(&self, start: Quark, path: &[&str]) -> Result<Quark> {
        let mut attributes = self.attributes.write();
        let quark = attributes.get_or_add_quark_relative(start, path)?;
        self.transient.write().ensure_attributes(attributes.num_attributes());
        Ok(quark)
    }

    pub fn get_sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.attributes.read().get_sub_attributes(quark, recursive)
    }

    pub fn get_quarks(&self, pattern: &[&str]) -> Vec<Quark> {
        self.attributes.read().get_quarks(pattern)
    }

    pub fn get_full_path(&self, quark: Quark) -> Result<String> {
        self.attributes.read().get_full_path(quark)
    }

    pub fn get_name(&self, quark: Quark) -> Result<String> {
        self.attributes.read().get_name(quark).map(str::to_string)
    }

    pub fn get_parent(&self, quark: Quark) -> Result<Option<Quark>> {
        self.attributes.read().get_parent(quark)
    }

    // -------------------------------------------------------------------------
    // State changes
    // -------------------------------------------------------------------------

    /// Sets `quark` to `value` from time `t`, closing its ongoing interval at `t - 1`.
    pub fn modify_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.transient
            .write()
            .process_state_change(t, value, quark, &self.tree)
    }

    /// Adds one to a counter attribute. A null attribute becomes 1.
    pub fn increment_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        let mut transient = self.transient.write();
        let next = transient.ongoing_value(quark)?.increment(1)?;
        transient.process_state_change(t, next, quark, &self.tree)
    }

    fn stack_depth(&self, quark: Quark) -> Result<i32> {
        match self.transient.read().ongoing_value(quark)? {
            StateValue::Null => Ok(0),
            StateValue::Int(depth) => Ok(*depth),
            other => Err(StateHistoryError::StateValueType {
                expected: "int",
                actual: other.type_name(),
            }),
        }
    }

    /// Pushes `value` on the stack attribute `quark`.
    ///
    /// The attribute holds the stack depth; element `n` lives in the
    /// sub-attribute named `n`.
    pub fn push_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        let depth = self.stack_depth(quark)?;
        if depth >= MAX_STACK_DEPTH {
            return Err(StateHistoryError::StackFull {
                quark,
                max: MAX_STACK_DEPTH,
            });
        }
        let depth = depth + 1;
        let element = self.get_or_add_quark_relative(quark, &[depth.to_string().as_str()])?;
        self.modify_attribute(t, StateValue::Int(depth), quark)?;
        self.modify_attribute(t, value, element)
    }

    /// Pops the top of the stack attribute `quark`.
    ///
    /// Returns `None` if the stack was never pushed or is already empty.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        let depth = match self.transient.read().ongoing_value(quark)? {
            StateValue::Null => return Ok(None),
            StateValue::Int(depth) if *depth <= 0 => {
                return Err(StateHistoryError::StackEmpty(quark));
            }
            StateValue::Int(depth) => *depth,
            other => {
                return Err(StateHistoryError::StateValueType {
                    expected: "int",
                    actual: other.type_name(),
                });
            }
        };

        let element = self.get_quark_relative(quark, &[depth.to_string().as_str()])?;
        let popped = self.transient.read().ongoing_value(element)?.clone();

        let remaining = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.modify_attribute(t, remaining, quark)?;
        self.remove_attribute(t, element)?;
        Ok(Some(popped))
    }

    /// Sets `quark` and every attribute below it to null from time `t`.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        let attributes = self.attributes.read();
        let mut subtree = attributes.get_sub_attributes(quark, true)?;
        subtree.push(quark);

        let mut transient = self.transient.write();
        for attribute in subtree {
            transient.process_state_change(t, StateValue::Null, attribute, &self.tree)?;
        }
        Ok(())
    }

    /// Rewrites the ongoing value of `quark` without closing an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.transient.write().update_ongoing_value(quark, value)
    }

    pub fn ongoing_state(&self, quark: Quark) -> Result<StateValue> {
        self.transient.read().ongoing_value(quark).cloned()
    }

    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Timestamp> {
        self.transient.read().ongoing_start(quark)
    }

    /// Answers queries for the attributes in `entries` from `entries`, from
    /// each entry's start on, until the current [`QueryLock`] is released.
    ///
    /// The builder's own ongoing state is left untouched, so state changes
    /// may continue. Replaces any state set by an earlier call.
    pub fn replace_ongoing_state(&self, entries: Vec<Interval>) -> Result<()> {
        let count = self.num_attributes();
        if let Some(unknown) = entries.iter().find(|e| e.attribute() as usize >= count) {
            return Err(StateHistoryError::AttributeNotFound(unknown.attribute()));
        }
        let mut replaced = self.replaced.write();
        replaced.clear();
        replaced.extend(entries.into_iter().map(|e| (e.attribute(), e)));
        Ok(())
    }

    /// Starts an exclusive query session for replaced ongoing state.
    pub fn take_query_lock(&self) -> QueryLock<'_> {
        QueryLock {
            system: self,
            _guard: self.query_lock.lock(),
        }
    }

    /// Replaced state of `quark` at `t`, if it covers `t`.
    fn replaced_at(replaced: &HashMap<Quark, Interval>, t: Timestamp, quark: Quark) -> Option<Interval> {
        let entry = replaced.get(&quark).filter(|e| t >= e.start())?;
        Interval::new(quark, entry.start(), t.max(entry.end()), entry.value().clone()).ok()
    }

    /// Closes every ongoing interval at `end` (or the latest known time, if
    /// later), closes the tree and stores the attribute tree in the file.
    pub fn close_history(&self, end: Timestamp) -> Result<()> {
        let attributes = self.attributes.read();
        let mut transient = self.transient.write();
        let end = transient.close(end, &self.tree)?;
        let blob = attributes.to_bytes()?;
        self.tree.close_tree_with_attributes(end, &blob)?;
        info!(
            path = %self.tree.path().display(),
            end,
            attributes = attributes.num_attributes(),
            "history closed"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    fn check_quark(&self, quark: Quark) -> Result<()> {
        if (quark as usize) < self.num_attributes() {
            Ok(())
        } else {
            Err(StateHistoryError::AttributeNotFound(quark))
        }
    }

    /// State of `quark` at `t`, from the ongoing state when it covers `t`.
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<Interval> {
        self.check_quark(quark)?;
        {
            let transient = self.transient.read();
            if let Some(state) = Self::replaced_at(&self.replaced.read(), t, quark) {
                return Ok(state);
            }
            if transient.covers(t, quark) {
                return transient.ongoing_interval(quark, t);
            }
        }
        self.tree.query_state_at(t, quark)
    }

    /// State of every attribute at `t`, indexed by quark.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<Interval>> {
        let count = self.num_attributes();
        let transient = self.transient.read();

        // Past the tree end only the ongoing state can answer.
        let from_tree = if t <= self.tree.tree_end() || !transient.is_active() {
            self.tree.query_full_state(t)?
        } else {
            Vec::new()
        };

        let replaced = self.replaced.read();
        let mut full = Vec::with_capacity(count);
        let mut from_tree = from_tree.into_iter();
        for idx in 0..count {
            let quark = idx as Quark;
            let stored = from_tree.next().flatten();
            let interval = if let Some(state) = Self::replaced_at(&replaced, t, quark) {
                state
            } else if transient.covers(t, quark) {
                transient.ongoing_interval(quark, t)?
            } else {
                stored.unwrap_or_else(|| Interval::null(quark, t, t))
            };
            full.push(interval);
        }
        Ok(full)
    }

    /// Intervals of `quark` overlapping `[t1, t2]`, in start order, including
    /// the ongoing interval.
    pub fn query_history_range(&self, quark: Quark, t1: Timestamp, t2: Timestamp) -> Result<Vec<Interval>> {
        self.check_quark(quark)?;
        let mut result = self
            .tree
            .query_intervals_overlapping(t1, t2, quark)?
            .collect::<Result<Vec<_>>>()?;

        let transient = self.transient.read();
        if transient.is_active() {
            let ongoing = transient.ongoing_interval(quark, t2)?;
            if ongoing.overlaps(t1, t2) && result.last().map_or(true, |last| last.start() < ongoing.start()) {
                result.push(ongoing);
            }
        }
        Ok(result)
    }
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("tree", &self.tree)
            .field("attributes", &self.num_attributes())
            .field("building", &self.is_building())
            .finish()
    }
}
