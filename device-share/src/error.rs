//! Error types for device share storage.

use serde::{Deserialize, Serialize};

/// Result type alias for share storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while persisting or reading a device share.
///
/// Under [`FailurePolicy::Lenient`](crate::FailurePolicy::Lenient) these never
/// reach callers of [`ShareStore`](crate::ShareStore); they are logged and the
/// operation reports absence instead.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    /// The backing store cannot be reached on this platform/device.
    #[error("Share storage not available: {0}")]
    NotAvailable(String),

    /// The embedded database rejected a statement or connection.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error while touching the store's files.
    #[error("I/O error: {0}")]
    Io(String),

    /// The OS keyring holding the master key failed.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Sealing or opening a share failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Stored data exists but cannot be interpreted.
    #[error("Stored data is corrupted: {0}")]
    Corrupted(String),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl Error {
    /// Stable code for programmatic handling and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotAvailable(_) => "NOT_AVAILABLE",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Keyring(_) => "KEYRING_ERROR",
            Error::Encryption(_) => "ENCRYPTION_ERROR",
            Error::Corrupted(_) => "CORRUPTED",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Task(_) => "TASK_ERROR",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}
