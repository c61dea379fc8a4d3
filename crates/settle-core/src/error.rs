//! Error types for settle-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using settle-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in settle-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or action not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote service failed or rejected a request
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Remote(error) => error.is_transient(),
            Self::Database(_) | Self::Sqlite(_) | Self::Io(_) => true,
            Self::NotFound(_) | Self::InvalidInput(_) | Self::Serialization(_) => false,
        }
    }
}
