//! Error taxonomy shared by the local queue, the remote ledger and the sync
//! coordinator.

use std::fmt;

/// Classification of a remote ledger failure. Every kind is retryable from
/// the coordinator's point of view; the kind only drives logging and the
/// operator diagnostic view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Connection refused, DNS failure, TLS failure.
    Network,
    /// The request did not complete within its deadline.
    Timeout,
    /// The backend rejected the request (HTTP 4xx).
    Rejected,
    /// The backend failed (HTTP 5xx).
    Server,
    /// The backend answered with a body we could not interpret.
    Decode,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::Network => "network",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Rejected => "rejected",
            RemoteErrorKind::Server => "server",
            RemoteErrorKind::Decode => "decode",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The local queue has not been opened yet (or was shut down).
    #[error("local sale queue is not initialized")]
    StorageUnavailable,

    #[error("local storage error: {0}")]
    Storage(String),

    /// Stale removal of a record that is already gone.
    #[error("pending sale {0} not found")]
    NotFound(i64),

    #[error("remote ledger error ({kind}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    /// Single-flight rejection of a drain request.
    #[error("sync already in progress")]
    SyncInProgress,

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        SyncError::Remote {
            kind,
            message: message.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SyncError::Remote { .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("payload encoding: {err}"))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
