//! Error types for daemon operations.
//!
//! These errors describe failures reported by (or while reaching) the remote
//! GPIO daemon. They convert into [`pinboard_core::Error`] so device code can
//! propagate them with `?`.

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur during daemon round trips.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DaemonError {
    /// The daemon could not be reached at the given address.
    #[error("Daemon unreachable at {address}")]
    Unreachable { address: String },

    /// The connection was closed before the operation.
    #[error("Connection closed")]
    Closed,

    /// The handle is unknown to the daemon.
    #[error("Bad handle: {handle}")]
    BadHandle { handle: i32 },

    /// The daemon rejected the operation.
    #[error("Operation rejected: {message}")]
    Rejected { message: String },
}

impl DaemonError {
    /// Create a new unreachable error.
    pub fn unreachable(address: impl Into<String>) -> Self {
        Self::Unreachable {
            address: address.into(),
        }
    }

    /// Create a new rejected operation error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

impl From<DaemonError> for pinboard_core::Error {
    fn from(error: DaemonError) -> Self {
        match error {
            DaemonError::Unreachable { .. } | DaemonError::Closed => {
                pinboard_core::Error::Connection(error.to_string())
            }
            other => pinboard_core::Error::Daemon(other.to_string()),
        }
    }
}
