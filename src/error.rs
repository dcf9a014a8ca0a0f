//! Error taxonomy for the storage and synchronization engine.
//!
//! Storage adapters, the router, the write buffer and the model lifecycle all
//! return [`EngineResult`]. Job handler bodies and the binary keep using
//! `anyhow` and convert at the edges.

use thiserror::Error;

/// Engine error
#[derive(Error, Debug)]
pub enum EngineError {
    /// A tier or the filesystem is temporarily unreachable; retried with backoff
    #[error("transient I/O failure in {scope}: {message}")]
    TransientIo { scope: String, message: String },

    /// A tier call exceeded its deadline
    #[error("{scope} call timed out after {elapsed_ms}ms")]
    Timeout { scope: String, elapsed_ms: u64 },

    /// Malformed or out-of-range input; rejected, never retried
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// Duplicate key on insert that could not be resolved by upsert
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Candidate model rejected by validation
    #[error("model validation failed: {0}")]
    ModelValidation(String),

    /// Invalid configuration; fatal at startup only
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// State machine transition that is not allowed
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn transient(scope: impl Into<String>, message: impl ToString) -> Self {
        EngineError::TransientIo {
            scope: scope.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(scope: impl Into<String>, elapsed: std::time::Duration) -> Self {
        EngineError::Timeout {
            scope: scope.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TransientIo { .. } | EngineError::Timeout { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return EngineError::ConcurrencyConflict(db.message().to_string());
            }
        }
        EngineError::transient("warm tier", e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::transient("filesystem", e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::DataIntegrity(format!("serialization: {}", e))
    }
}
