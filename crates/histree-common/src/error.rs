//! Error types for the history-tree interval store.

use thiserror::Error;

/// Result type alias using StateHistoryError.
pub type Result<T> = std::result::Result<T, StateHistoryError>;

/// Errors that can occur in history-tree operations.
#[derive(Debug, Error)]
pub enum StateHistoryError {
    // Time range errors
    #[error("Time range error: [{start}, {end}]: {reason}")]
    TimeRange {
        start: i64,
        end: i64,
        reason: String,
    },

    // Attribute errors
    #[error("Attribute not found: {0}")]
    AttributeNotFound(u32),

    #[error("Attribute path not found: {0}")]
    AttributePathNotFound(String),

    #[error("Stack attribute {0} is empty")]
    StackEmpty(u32),

    #[error("Stack attribute {quark} is full ({max} elements)")]
    StackFull { quark: u32, max: i32 },

    // Node errors
    #[error("History tree node full")]
    NodeFull,

    #[error("Interval too large: {size} bytes (max {max})")]
    IntervalTooLarge { size: usize, max: usize },

    // Storage errors
    #[error("Storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    // State value errors
    #[error("State value type mismatch: expected {expected}, got {actual}")]
    StateValueType {
        expected: &'static str,
        actual: &'static str,
    },

    // Lifecycle errors
    #[error("History tree is closed")]
    TreeClosed,

    #[error("Query cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StateHistoryError {
    /// Builds a time range error for the given bounds.
    pub fn time_range(start: i64, end: i64, reason: impl Into<String>) -> Self {
        StateHistoryError::TimeRange {
            start,
            end,
            reason: reason.into(),
        }
    }

    /// Returns true for errors that make the backing file unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StateHistoryError::Format(_) | StateHistoryError::StorageIo(_)
        )
    }
}
