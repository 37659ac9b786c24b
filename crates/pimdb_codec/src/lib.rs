//! # pimdb codec
//!
//! Canonical self-describing buffer encoding for pimdb.
//!
//! Entity payloads, metadata and command payloads are stored as opaque
//! byte buffers. This crate defines the single encoding all of those
//! buffers use, with deterministic output:
//!
//! - Map keys are sorted by their encoded form
//! - Integers and lengths use minimal-length varints
//! - Strings must be UTF-8
//! - No floats
//!
//! Determinism matters because re-encoding a decoded buffer must yield
//! the identical bytes; higher layers rely on that for change detection.
//!
//! ## Usage
//!
//! ```
//! use pimdb_codec::{encode, decode, Value};
//!
//! let value = Value::Text("hello".into());
//! let bytes = encode(&value).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod reader;
mod value;
mod writer;

pub use error::{CodecError, CodecResult};
pub use reader::{decode, BufferReader};
pub use value::Value;
pub use writer::{encode, BufferWriter};

/// Trait for types with a canonical buffer representation.
pub trait Encode {
    /// Encodes this value to canonical buffer bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types decodable from canonical buffer bytes.
pub trait Decode: Sized {
    /// Decodes this value from canonical buffer bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        decode(bytes)
    }
}
