//! Attribute tree: hierarchical attribute paths mapped to dense quarks.
//!
//! Quarks are allocated in creation order starting at 0, so they double as
//! indexes into per-attribute tables. The tree is append-only: attributes are
//! never renamed or removed.

use histree_common::{Quark, Result, StateHistoryError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Quark of the implicit root; parent of every top-level attribute.
pub const ROOT_QUARK: Quark = Quark::MAX;

/// Path element matching any single attribute name in [`AttributeTree::get_quarks`].
pub const WILDCARD: &str = "*";

/// Current version of the serialized attribute tree.
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttributeEntry {
    name: String,
    parent: Quark,
}

/// Serialized form: entries in quark order. Children and lookup tables are
/// rebuilt on load.
#[derive(Serialize, Deserialize)]
struct AttributeTreeBlob {
    version: u32,
    entries: Vec<AttributeEntry>,
}

/// Hierarchy of named attributes.
#[derive(Debug, Clone, Default)]
pub struct AttributeTree {
    entries: Vec<AttributeEntry>,
    /// Children of each quark, in creation order.
    children: Vec<Vec<Quark>>,
    /// Children of the root, in creation order.
    top_level: Vec<Quark>,
    /// (parent, name) -> quark.
    lookup: HashMap<(Quark, String), Quark>,
}

impl AttributeTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes; also the next quark to be allocated.
    pub fn num_attributes(&self) -> usize {
        self.entries.len()
    }

    fn check(&self, quark: Quark) -> Result<()> {
        if quark == ROOT_QUARK || (quark as usize) < self.entries.len() {
            Ok(())
        } else {
            Err(StateHistoryError::AttributeNotFound(quark))
        }
    }

    fn child(&self, parent: Quark, name: &str) -> Option<Quark> {
        self.lookup.get(&(parent, name.to_string())).copied()
    }

    fn add_child(&mut self, parent: Quark, name: &str) -> Quark {
        let quark = self.entries.len() as Quark;
        self.entries.push(AttributeEntry {
            name: name.to_string(),
            parent,
        });
        self.children.push(Vec::new());
        self.children_mut(parent).push(quark);
        self.lookup.insert((parent, name.to_string()), quark);
        quark
    }

    fn children_of(&self, quark: Quark) -> &[Quark] {
        if quark == ROOT_QUARK {
            &self.top_level
        } else {
            &self.children[quark as usize]
        }
    }

    fn children_mut(&mut self, quark: Quark) -> &mut Vec<Quark> {
        if quark == ROOT_QUARK {
            &mut self.top_level
        } else {
            &mut self.children[quark as usize]
        }
    }

    /// Looks up the quark of an absolute path. The empty path is the root.
    pub fn get_quark_for_path(&self, path: &[&str]) -> Result<Quark> {
        self.get_quark_relative(ROOT_QUARK, path)
    }

    /// Looks up the quark of an absolute path, creating missing attributes.
    pub fn get_or_add_quark_for_path(&mut self, path: &[&str]) -> Quark {
        let mut current = ROOT_QUARK;
        for name in path {
            current = match self.child(current, name) {
                Some(quark) => quark,
                None => self.add_child(current, name),
            };
        }
        current
    }

    /// Looks up `path` below `start`.
    pub fn get_quark_relative(&self, start: Quark, path: &[&str]) -> Result<Quark> {
        self.check(start)?;
        let mut current = start;
        for name in path {
            current = self.child(current, name).ok_or_else(|| {
                let mut full = if start == ROOT_QUARK {
                    Vec::new()
                } else {
                    self.path_elements(start)
                };
                full.extend(path.iter().map(|s| s.to_string()));
                StateHistoryError::AttributePathNotFound(full.join("/"))
            })?;
        }
        Ok(current)
    }

    /// Looks up `path` below `start`, creating missing attributes.
    pub fn get_or_add_quark_relative(&mut self, start: Quark, path: &[&str]) -> Result<Quark> {
        self.check(start)?;
        let mut current = start;
        for name in path {
            current = match self.child(current, name) {
                Some(quark) => quark,
                None => self.add_child(current, name),
            };
        }
        Ok(current)
    }

    /// Returns the children of `quark`, or its whole subtree (depth first)
    /// when `recursive` is set.
    pub fn get_sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.check(quark)?;
        let mut result = Vec::new();
        if recursive {
            let mut stack: Vec<Quark> = self.children_of(quark).iter().rev().copied().collect();
            while let Some(current) = stack.pop() {
                result.push(current);
                stack.extend(self.children_of(current).iter().rev().copied());
            }
        } else {
            result.extend_from_slice(self.children_of(quark));
        }
        Ok(result)
    }

    /// Returns every quark matching `pattern`, where [`WILDCARD`] matches any
    /// single path element.
    pub fn get_quarks(&self, pattern: &[&str]) -> Vec<Quark> {
        let mut current = vec![ROOT_QUARK];
        for element in pattern {
            let mut next = Vec::new();
            for &quark in &current {
                if *element == WILDCARD {
                    next.extend_from_slice(self.children_of(quark));
                } else if let Some(child) = self.child(quark, element) {
                    next.push(child);
                }
            }
            current = next;
        }
        current.retain(|&quark| quark != ROOT_QUARK);
        current
    }

    /// Name of an attribute.
    pub fn get_name(&self, quark: Quark) -> Result<&str> {
        self.entries
            .get(quark as usize)
            .map(|entry| entry.name.as_str())
            .ok_or(StateHistoryError::AttributeNotFound(quark))
    }

    /// Parent of an attribute, `None` for top-level attributes.
    pub fn get_parent(&self, quark: Quark) -> Result<Option<Quark>> {
        let entry = self
            .entries
            .get(quark as usize)
            .ok_or(StateHistoryError::AttributeNotFound(quark))?;
        Ok((entry.parent != ROOT_QUARK).then_some(entry.parent))
    }

    fn path_elements(&self, quark: Quark) -> Vec<String> {
        let mut elements = Vec::new();
        let mut current = quark;
        while let Some(entry) = self.entries.get(current as usize) {
            elements.push(entry.name.clone());
            current = entry.parent;
        }
        elements.reverse();
        elements
    }

    /// Path elements from the root down to `quark`.
    pub fn get_full_path_elements(&self, quark: Quark) -> Result<Vec<String>> {
        self.check(quark)?;
        Ok(self.path_elements(quark))
    }

    /// Full path of `quark`, elements joined with `/`.
    pub fn get_full_path(&self, quark: Quark) -> Result<String> {
        Ok(self.get_full_path_elements(quark)?.join("/"))
    }

    /// Serializes the tree with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let blob = AttributeTreeBlob {
            version: FORMAT_VERSION,
            entries: self.entries.clone(),
        };
        bincode::serialize(&blob)
            .map_err(|e| StateHistoryError::Format(format!("cannot encode attribute tree: {}", e)))
    }

    /// Rebuilds a tree serialized by [`AttributeTree::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let blob: AttributeTreeBlob = bincode::deserialize(bytes)
            .map_err(|e| StateHistoryError::Format(format!("cannot decode attribute tree: {}", e)))?;
        if blob.version != FORMAT_VERSION {
            return Err(StateHistoryError::Format(format!(
                "unsupported attribute tree version: {}",
                blob.version
            )));
        }

        let mut tree = Self::new();
        for (idx, entry) in blob.entries.into_iter().enumerate() {
            // Parents always precede their children
            if entry.parent != ROOT_QUARK && entry.parent as usize >= idx {
                return Err(StateHistoryError::Format(format!(
                    "attribute {} has invalid parent {}",
                    idx, entry.parent
                )));
            }
            if tree.child(entry.parent, &entry.name).is_some() {
                return Err(StateHistoryError::Format(format!(
                    "duplicate attribute name {:?} under parent {}",
                    entry.name, entry.parent
                )));
            }
            tree.add_child(entry.parent, &entry.name);
        }
        Ok(tree)
    }
}
