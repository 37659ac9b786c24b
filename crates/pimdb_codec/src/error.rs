//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input at offset {offset}")]
    Truncated {
        /// Offset at which more bytes were expected.
        offset: usize,
    },

    /// Unknown type tag.
    #[error("unknown type tag {tag:#04x} at offset {offset}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
        /// Offset of the tag.
        offset: usize,
    },

    /// The encoding violates a canonical-form rule.
    #[error("non-canonical encoding: {message}")]
    NonCanonical {
        /// Which rule was violated.
        message: String,
    },

    /// Text was not valid UTF-8.
    #[error("invalid UTF-8 in text value")]
    InvalidUtf8,

    /// A declared length exceeds the sanity limit.
    #[error("declared length {length} exceeds limit")]
    LengthOverflow {
        /// The declared length.
        length: u64,
    },

    /// The buffer has a valid shape but the wrong content.
    #[error("malformed buffer: {message}")]
    Malformed {
        /// Description of the problem.
        message: String,
    },
}

impl CodecError {
    /// Creates a non-canonical-encoding error.
    pub fn non_canonical(message: impl Into<String>) -> Self {
        Self::NonCanonical {
            message: message.into(),
        }
    }

    /// Creates a malformed-buffer error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}
