//! WolfTable Error Types

use thiserror::Error;

/// Result type alias for WolfTable operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfTable error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Part errors
    #[error("Malformed part name: {0}")]
    MalformedPartName(String),

    #[error("Part not found: {0}")]
    PartNotFound(String),

    #[error("Checksum mismatch for part {part}: {reason}")]
    ChecksumMismatch { part: String, reason: String },

    #[error("Malformed checksums file: {0}")]
    MalformedChecksums(String),

    // Log / queue errors
    #[error("Malformed log entry: {0}")]
    MalformedLogEntry(String),

    // Metadata errors
    #[error("Table metadata in the coordinator differs from the local configuration: {found}")]
    MetadataMismatch { found: String },

    #[error("Unexpected column in coordinator metadata: expected {expected}, found {found}")]
    UnknownColumn { expected: String, found: String },

    // Coordinator errors
    #[error("Coordination service is unavailable")]
    CoordinatorUnavailable,

    #[error("Coordinator session has expired")]
    SessionExpired,

    #[error("Coordinator node not found: {0}")]
    NoNode(String),

    #[error("Coordinator node already exists: {0}")]
    NodeExists(String),

    #[error("Coordinator error: {0}")]
    Coordinator(String),

    // Replication errors
    #[error("Replica {0} appears to be already active. If you're sure it's not, remove its is_active node manually")]
    ReplicaIsAlreadyActive(String),

    #[error("The local set of parts doesn't look like the set of parts in the coordinator. {0}")]
    TooManyUnexpectedParts(String),

    #[error("No active replica has part {0}")]
    NoReplicaHasPart(String),

    #[error("Table is in read only mode")]
    TableIsReadOnly,

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is transient: the operation that failed with it
    /// may succeed when retried from the queue later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NoReplicaHasPart(_)
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::SessionExpired
        )
    }
}
