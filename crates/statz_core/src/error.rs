//! Error types for the statistics pipeline.
//!
//! Transient persistence problems never reach producers: the flush scheduler
//! absorbs them, retries, and logs. What remains visible here are programmer
//! errors (unknown kinds, malformed updates), read failures, and the outcome
//! of flushes that a caller explicitly waited for.

use thiserror::Error;

/// Errors raised by a [`RowStore`](crate::store::RowStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {message}")]
    Task { message: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Main error type for statistics operations.
#[derive(Debug, Error)]
pub enum StatzError {
    /// The kind is unknown or not registered. Programmer error.
    #[error("Invalid statistic kind: {kind}")]
    InvalidStatisticKind { kind: String },

    /// An update does not match its kind's declared schema. Programmer error.
    #[error("Schema violation for {kind}: {message}")]
    SchemaViolation { kind: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A flush the caller waited on left records unpersisted.
    #[error("Flush left records unpersisted: {requeued} requeued, {dropped} dropped")]
    UnpersistedRecords { requeued: usize, dropped: usize },

    /// The task running a flush panicked or was aborted.
    #[error("Flush task failed: {message}")]
    FlushTask { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl StatzError {
    pub fn invalid_kind(kind: impl Into<String>) -> Self {
        Self::InvalidStatisticKind { kind: kind.into() }
    }

    pub fn schema_violation(kind: impl ToString, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn flush_task(message: impl Into<String>) -> Self {
        Self::FlushTask {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error indicates a bug in the caller rather than an
    /// operational condition.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            StatzError::InvalidStatisticKind { .. } | StatzError::SchemaViolation { .. }
        )
    }
}

pub type StatzResult<T> = Result<T, StatzError>;
pub type StoreResult<T> = Result<T, StoreError>;
