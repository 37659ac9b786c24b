//! Error types for pimdb core.

use pimdb_codec::CodecError;
use pimdb_storage::{ErrorCode, StorageError};
use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an error, used by retry and status policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lookup found nothing; often benign.
    NotFound,
    /// Stored data violates an invariant; the resource stops accepting
    /// writes until recovered.
    Corruption,
    /// May succeed if retried (network, lock contention).
    Transient,
    /// Wrong database, wrong mode, schema mismatch.
    Misconfiguration,
    /// Malformed command buffer or unknown command id.
    Protocol,
    /// The request was aborted.
    Cancelled,
}

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Buffer codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A required entity, revision or mapping is missing.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A stored invariant does not hold.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the violated invariant.
        message: String,
    },

    /// The operation may succeed if retried.
    #[error("transient failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The engine is wired up wrong.
    #[error("misconfiguration: {message}")]
    Misconfiguration {
        /// Description of the problem.
        message: String,
    },

    /// A command buffer could not be understood.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the problem.
        message: String,
    },

    /// No adaptor is registered for this entity type.
    #[error("unknown entity type: {type_name}")]
    UnknownType {
        /// The unregistered type name.
        type_name: String,
    },

    /// The request was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a misconfiguration error.
    pub fn misconfiguration(message: impl Into<String>) -> Self {
        Self::Misconfiguration {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an unknown-type error.
    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        Self::UnknownType {
            type_name: type_name.into(),
        }
    }

    /// Returns the error's classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage(err) => match err.code {
                ErrorCode::NotFound => ErrorKind::NotFound,
                ErrorCode::Corruption => ErrorKind::Corruption,
                ErrorCode::Transient => ErrorKind::Transient,
                ErrorCode::Misconfiguration => ErrorKind::Misconfiguration,
                ErrorCode::Generic => ErrorKind::Transient,
            },
            Error::Codec(_) => ErrorKind::Protocol,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Corruption { .. } => ErrorKind::Corruption,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Misconfiguration { .. } | Error::UnknownType { .. } => {
                ErrorKind::Misconfiguration
            }
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
