//! Error types for provenance sinks.

use thiserror::Error;

/// Result type alias for provenance operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while recording or reading provenance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The sink could not complete an operation.
    #[error("provenance sink {operation} failed: {reason}")]
    SinkFailed { operation: String, reason: String },

    /// The same entry was recorded twice. The log is append-only.
    #[error("entry {entry_id} already recorded")]
    DuplicateEntry { entry_id: String },

    /// The sink has been closed and accepts no more entries.
    #[error("provenance sink is closed")]
    Closed,
}

impl Error {
    /// Create a sink failed error.
    pub fn sink_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SinkFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a duplicate entry error.
    pub fn duplicate_entry(entry_id: impl ToString) -> Self {
        Self::DuplicateEntry {
            entry_id: entry_id.to_string(),
        }
    }
}
