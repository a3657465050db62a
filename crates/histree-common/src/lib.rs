//! Shared types, errors, and configuration for the history-tree interval store.
//!
//! This crate provides the definitions used by every other component: the
//! state value model, the interval value type, the error taxonomy and the
//! tree configuration.

pub mod config;
pub mod error;
pub mod interval;
pub mod types;

pub use config::{HistoryTreeConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CHILDREN};
pub use error::{Result, StateHistoryError};
pub use interval::Interval;
pub use types::{Quark, StateValue, Timestamp, ValueTag};
