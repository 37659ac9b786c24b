//! Error types for the synchronizer.

use thiserror::Error;

/// Result type for synchronizer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A local core operation failed.
    #[error(transparent)]
    Core(#[from] pimdb_core::Error),

    /// The remote source reported a failure.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Source-defined non-zero error code.
        code: i32,
        /// Human-readable description.
        message: String,
    },

    /// The request was cancelled.
    #[error("sync request cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a remote-failure error.
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// The source-visible error code; zero for local errors.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            SyncError::Remote { code, .. } => *code,
            SyncError::Core(_) => -1,
            SyncError::Cancelled => -2,
        }
    }

    /// True if the failure may clear on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote { .. } => true,
            SyncError::Core(error) => error.kind() == pimdb_core::ErrorKind::Transient,
            SyncError::Cancelled => false,
        }
    }
}
