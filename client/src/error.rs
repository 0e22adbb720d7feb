//! Error types for the sync runtime.

use tandem_engine::PrincipalId;

/// Local persistence failures.
///
/// These never escape the [`LocalStore`](crate::LocalStore); they are logged
/// and the write is dropped.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("quota exceeded writing '{key}': limit is {limit} bytes")]
    QuotaExceeded { key: String, limit: usize },

    #[error("corrupt data under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// How the scheduler reacts to a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retried by the next debounce or periodic tick
    Network,
    /// Flushing pauses until credentials are refreshed
    Auth,
    /// Logged and not retried
    Validation,
}

/// Failures from the remote record service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Network(String),

    #[error("remote rejected credentials: {0}")]
    Auth(String),

    #[error("remote rejected payload: {0}")]
    Validation(String),

    #[error("remote record not found: {0}")]
    NotFound(String),

    #[error("unexpected remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Map onto the scheduler's failure taxonomy.
    ///
    /// `NotFound` is usually handled by the caller first (a delete of a
    /// missing row succeeded, an update falls back to create); when it is
    /// not, the request cannot succeed as sent and counts as a rejection.
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Network(_) | RemoteError::Protocol(_) => FailureKind::Network,
            RemoteError::Auth(_) => FailureKind::Auth,
            RemoteError::Validation(_) | RemoteError::NotFound(_) => FailureKind::Validation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Protocol(err.to_string())
        } else if err.is_builder() {
            RemoteError::Validation(err.to_string())
        } else {
            // timeouts, refused connections, resets
            RemoteError::Network(err.to_string())
        }
    }
}

/// Errors returned from the [`SyncEngine`](crate::SyncEngine) facade.
///
/// Only caller mistakes surface here. Storage and remote failures are
/// absorbed by the engine and reported through
/// [`SyncStatus`](crate::SyncStatus).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("engine error: {0}")]
    Engine(#[from] tandem_engine::Error),

    #[error("no principal is signed in")]
    NotInitialized,

    #[error("session for '{0}' was replaced before initialization finished")]
    Superseded(PrincipalId),
}

/// Result type alias for facade operations.
pub type Result<T> = std::result::Result<T, SyncError>;
