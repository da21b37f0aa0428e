//! Error types for the rollout store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// Every variant except `NotFound` and `Conflict` is an infrastructure
/// failure: callers batching work over the store treat those as transient
/// and retry on the next scheduler tick.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode record: {0}")]
    Decode(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The record exists but cannot take the requested change.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StateError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True for failures of the storage layer itself rather than of the request.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::Conflict(_))
    }
}
