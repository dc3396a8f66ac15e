//! Error types for the replica crate.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing the local replica.
///
/// None of these are fatal: every variant leaves the service in a state that a
/// later `perform_sync` can recover from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The remote authority could not be reached.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The remote authority refused a single pushed mutation.
    #[error("Remote rejected mutation {mutation}: {reason}")]
    RemoteRejected { mutation: Uuid, reason: String },

    /// Local read or write fault.
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// A sync pass did not finish in time.
    #[error("Sync pass timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration could not be loaded or saved.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether this error only affects one pushed mutation.
    pub fn is_per_mutation(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteRejected { .. } | SyncError::NetworkUnavailable(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::StorageFailure(err.to_string())
    }
}
