//! WolfElect Error Types

use thiserror::Error;

use crate::store::Revision;

/// Result type alias for WolfElect operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfElect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Coordination store errors
    #[error("No such key: {0}")]
    NotFound(String),

    #[error("Revision mismatch: expected changes before {expected}, key is at {actual}")]
    OldRevision { expected: Revision, actual: Revision },

    #[error("Revision {0} is too late (history no longer available)")]
    TooLate(Revision),

    #[error("Store error: {0}")]
    Store(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Election errors
    #[error("Election error: {0}")]
    Election(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a lost CAS race rather than a real failure
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::OldRevision { .. } | Error::TooLate(_))
    }

    /// Check if this error means the key does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Io(_)
        )
    }
}
