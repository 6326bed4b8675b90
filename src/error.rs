//! Error types for qvmd.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using qvmd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in qvmd operations.
#[derive(Error, Debug)]
pub enum Error {
    // VM lifecycle errors
    /// A process handle already exists.
    #[error("vm is already running")]
    AlreadyRunning,

    /// The operation requires a live process.
    #[error("vm is not running")]
    NotRunning,

    /// No disk image has been recorded for the VM.
    #[error("no disk image configured")]
    NoImageConfigured,

    /// The emulator could not be spawned.
    #[error("failed to spawn emulator: {0}")]
    SpawnFailed(String),

    /// The restored VM could not be resumed. The process is left as the
    /// configured resume policy dictates.
    #[error("failed to resume vm: {0}")]
    ResumeFailed(String),

    /// Requested VM settings are out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Disk image path does not exist.
    #[error("image not found: {}", path.display())]
    ImageNotFound {
        /// Path that was not found.
        path: PathBuf,
    },

    // Snapshot errors
    /// Snapshot blob does not exist.
    #[error("snapshot not found: {name}")]
    SnapshotNotFound {
        /// Snapshot name.
        name: String,
    },

    /// Snapshot name contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid snapshot name: {0:?}")]
    InvalidSnapshotName(String),

    // Control protocol errors
    /// The control server reported an error.
    #[error("qmp error: {0}")]
    Protocol(String),

    /// No response within the session timeout.
    #[error("qmp timeout")]
    Timeout,

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a protocol error with the server-supplied description.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a spawn failure.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Create a snapshot-not-found error.
    pub fn snapshot_not_found(name: impl Into<String>) -> Self {
        Self::SnapshotNotFound { name: name.into() }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this is a connection refusal (listener not bound yet).
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused)
    }
}
