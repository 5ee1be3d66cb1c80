//! Error types for the question bank core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the caching, index sync and session subsystems
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // External collaborators
    // =========================================================================
    /// Fast cache (Redis) could not be reached or rejected a command
    #[error("Fast cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Primary store (PostgreSQL) could not be reached or rejected a query
    #[error("Primary store unavailable: {0}")]
    StoreUnavailable(String),

    /// Message broker error
    #[error("Message broker error: {0}")]
    Broker(String),

    /// Search index error
    #[error("Search index error: {0}")]
    Index(String),

    // =========================================================================
    // Authorization
    // =========================================================================
    /// Generic authorization failure.
    ///
    /// Covers a mismatched token, a missing entry, a revoked session, a
    /// suspended account and an unavailable session store alike.
    #[error("not logged in")]
    NotLoggedIn,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the caller should answer with an authorization failure.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(self, Error::NotLoggedIn)
    }

    /// True for failures of an external store that callers may degrade around.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::CacheUnavailable(_)
                | Error::StoreUnavailable(_)
                | Error::Broker(_)
                | Error::Index(_)
        )
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Error::CacheUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::CacheUnavailable(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<tantivy::TantivyError> for Error {
    fn from(err: tantivy::TantivyError) -> Self {
        Error::Index(err.to_string())
    }
}
