//! Error types for the dactyl daemon

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur in the daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Caller-visible service error
    #[error(transparent)]
    Service(#[from] dactyl_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Template store error
    #[error("Store error: {0}")]
    Store(String),

    /// Template not found in the store
    #[error("No stored template for that finger")]
    TemplateNotFound,

    /// Hardware reported a failure outside an operation callback
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// IPC error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The controller for a device has shut down
    #[error("Device controller is gone")]
    ControllerGone,
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}

impl DaemonError {
    /// Collapse into the caller-visible taxonomy for IPC replies.
    pub fn into_service_error(self) -> dactyl_core::Error {
        match self {
            DaemonError::Service(e) => e,
            other => dactyl_core::Error::Internal(other.to_string()),
        }
    }
}
