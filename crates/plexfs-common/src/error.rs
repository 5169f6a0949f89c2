//! Error types shared across the plexfs crates.

use thiserror::Error;

/// Common result type for plexfs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for plexfs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed file name: {0}")]
    MalformedFileName(String),

    #[error("duplicate log sequence: {0}")]
    DuplicateLogSeq(i64),

    #[error("no commit record: {0}")]
    MissingCommitRecord(String),

    #[error("invalid commit record format: {0}")]
    InvalidCommitRecord(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
