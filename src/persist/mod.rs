//! Store error types and the SQLite-backed capacity store.

/// SQLite store, unit-of-work transactions, and schema.
pub mod sqlite;

use thiserror::Error;

/// Store-level failures. None of these carry business meaning.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Error reported by SQLite.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Ledger metadata could not be encoded or decoded.
    #[error("metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// A thread panicked while holding a store lock.
    #[error("store lock poisoned")]
    Poisoned,
    /// A stored row violates the model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result alias for store operations.
pub type PersistResult<T> = Result<T, PersistError>;
