//! Error types for the Surge state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by the embedded store.
///
/// redb and serde_json failures are flattened to strings at this
/// boundary; callers branch on which operation failed, not on backend
/// detail.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("could not encode record: {0}")]
    Serialize(String),

    #[error("could not decode record: {0}")]
    Deserialize(String),
}
