//! Error taxonomy for the database layer.
//!
//! SQLSTATE classes that matter to callers get their own variants:
//! unique violations (23505) surface as [`DbError::Conflict`] → HTTP 409,
//! serialization failures (40001) as [`DbError::Serialization`] → retried,
//! deadlocks (40P01) as [`DbError::Deadlock`] → aborted with 503.

use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique or foreign-key violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transaction serialization failure (SQLSTATE 40001); retryable
    #[error("Serialization failure: {0}")]
    Serialization(String),

    /// Deadlock detected (SQLSTATE 40P01); abort, do not retry
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                return Self::Conflict(db_err.message().to_string());
            }
            match db_err.code().as_deref() {
                Some(SQLSTATE_SERIALIZATION_FAILURE) => {
                    return Self::Serialization(db_err.message().to_string());
                }
                Some(SQLSTATE_DEADLOCK_DETECTED) => {
                    return Self::Deadlock(db_err.message().to_string());
                }
                _ => {}
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return Self::NotFound("row not found".to_string());
        }
        Self::Sqlx(err)
    }
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}
