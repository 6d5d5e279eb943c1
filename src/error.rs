// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the registry engine.
//!
//! The engine is designed to absorb operational failures locally: sync and
//! verification failures are recorded on the registry row and retried later,
//! never raised past the public operations. The errors defined here therefore
//! cover the narrower set of conditions that *do* cross the boundary.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Cache` | Yes | Cursor cache backend unavailable (treated as cold start by the batcher) |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidArgument` | No | Precondition violation (e.g. zero batch size) |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`EngineError::is_retryable()`] to determine if an operation should be
//! retried with backoff. Note that the batch cursor never surfaces `Cache`
//! errors at all: a cache outage degrades to a cold start from the table
//! minimum, which is safe because re-syncing an already-synced id is a no-op.

use thiserror::Error;

/// Result type alias for registry engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the registry engine.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Cursor cache backend error.
    ///
    /// Occurs when the volatile cache holding the batch cursor is unreachable.
    /// Retryable, but callers inside the engine degrade to a cold start
    /// instead of retrying: the cursor is reconstructible from the tables.
    #[error("Cursor cache error ({operation}): {message}")]
    Cache {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error while reading or writing registry rows.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Registry store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Occurs during engine initialization if config is malformed.
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Precondition violation by the caller.
    ///
    /// The only condition the public operations are allowed to fail fast on
    /// (e.g. a zero batch size). Not retryable - indicates a bug in the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    /// Not retryable - indicates a bug that needs investigation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a cache error from a redis::RedisError
    pub fn cache(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Cache {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cache { .. } => true, // Cache backends come back
            Self::Store(_) => false,    // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidArgument(_) => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_cache() {
        let source = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        let err = EngineError::cache("GET", source);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("GET"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_not_retryable_store() {
        let err = EngineError::Store(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = EngineError::Config("invalid sqlite path".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_argument() {
        let err = EngineError::InvalidArgument("batch_size must be positive".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = EngineError::Internal("unexpected state".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cache_error_formatting() {
        let err = EngineError::Cache {
            operation: "SET".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Cursor cache error"));
        assert!(msg.contains("SET"));
        assert!(msg.contains("timeout"));
    }
}
