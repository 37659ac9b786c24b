//! Error types for the storage crate.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Classification of a storage error.
///
/// Callers branch on the code; the message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A lookup found nothing. Often not an error for the caller.
    NotFound,
    /// Stored data violates an invariant.
    Corruption,
    /// The operation may succeed if retried.
    Transient,
    /// Wrong database, wrong mode, permission problem.
    Misconfiguration,
    /// Anything else.
    Generic,
}

impl ErrorCode {
    /// Short stable name for log output.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not-found",
            ErrorCode::Corruption => "corruption",
            ErrorCode::Transient => "transient",
            ErrorCode::Misconfiguration => "misconfiguration",
            ErrorCode::Generic => "generic",
        }
    }
}

/// An error from the storage backend.
///
/// `store` names the environment (and database, when applicable) the
/// error originated in, so one log line is enough to locate it.
#[derive(Debug, Clone, Error)]
#[error("storage error in {store} ({}): {message}", .code.name())]
pub struct StorageError {
    /// Environment or `environment/database` the error came from.
    pub store: String,
    /// Error classification.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl StorageError {
    /// Creates a new storage error.
    pub fn new(store: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            code,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(store, ErrorCode::NotFound, message)
    }

    /// Creates a corruption error.
    pub fn corruption(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(store, ErrorCode::Corruption, message)
    }

    /// Creates a misconfiguration error.
    pub fn misconfiguration(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(store, ErrorCode::Misconfiguration, message)
    }

    /// Wraps an I/O error.
    pub fn io(store: impl Into<String>, err: &io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::Misconfiguration,
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => ErrorCode::Transient,
            _ => ErrorCode::Generic,
        };
        Self::new(store, code, err.to_string())
    }

    /// True if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

/// Callback invoked for errors surfaced during scans and handlers.
pub type ErrorHandler = std::sync::Arc<dyn Fn(&StorageError) + Send + Sync>;

/// The default error handler: logs at warn level.
#[must_use]
pub fn basic_error_handler() -> ErrorHandler {
    std::sync::Arc::new(|error: &StorageError| {
        tracing::warn!(
            store = %error.store,
            code = error.code.name(),
            "{}",
            error.message
        );
    })
}
