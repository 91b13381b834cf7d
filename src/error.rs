//! Error Taxonomy
//!
//! A single error enum shared by every component. Kinds, not types: callers
//! match on the variant, not on which module raised it.

use thiserror::Error;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The engine's error taxonomy.
///
/// Validation and precondition errors are surfaced verbatim. Embedding and
/// extraction failures never reach this enum at the call sites that are
/// documented as non-fatal (`store`, `update`) — they are logged and
/// swallowed there instead.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// Validation failed: empty project/content, unknown confidence, an
    /// impossible temporal filter, and similar.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A fact, agent, or ledger range does not exist, or a fact is inactive
    /// where an active one was required.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition was violated: updating an already-deprecated fact,
    /// registering a duplicate agent where uniqueness is required.
    #[error("conflict: {0}")]
    Conflict(String),

    /// `verify_ledger` detected a hash-chain or Merkle mismatch.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The connection pool or a bounded cache is exhausted; retry with
    /// backoff.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The underlying store is busy/locked. The engine retries internally
    /// with bounded backoff before this is surfaced.
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// The embedder or extractor circuit is open; the operation degraded
    /// rather than failing outright, or degrading was not possible.
    #[error("external collaborator unavailable: {0}")]
    ExternalUnavailable(String),

    /// An invariant was violated. A bug, not a user error.
    #[error("internal error: {0}")]
    Internal(String),

    /// A lower-level database error that didn't map to a more specific kind.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem I/O failure (export, migrations, db file setup).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for `meta`/`tags`/ledger documents.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors where SQLite reports the database as busy/locked.
    /// Used by the pool's bounded-retry loop (see `storage::pool`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Database(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}
