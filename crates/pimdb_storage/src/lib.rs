//! # pimdb storage
//!
//! Transactional ordered byte-keyed storage with named sub-databases.
//!
//! One [`Environment`] corresponds to one on-disk directory (one resource
//! instance). Inside an environment live any number of named databases,
//! each an ordered map from byte keys to byte values, optionally with
//! duplicate keys.
//!
//! ## Concurrency contract
//!
//! - At most one write transaction at a time per environment.
//! - Read transactions take a consistent snapshot and never block the
//!   writer (copy-on-write at database granularity).
//! - Exactly one environment is kept alive per path process-wide; all
//!   openers share it.
//!
//! ## Durability
//!
//! Committed write transactions are appended to a checksummed redo log
//! which is replayed on open. A torn tail (crash mid-append) is
//! truncated; corruption before the tail is an error.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pimdb_storage::{Environment, AccessMode};
//!
//! let env = Environment::open(path, AccessMode::ReadWrite)?;
//! {
//!     let mut txn = env.begin(AccessMode::ReadWrite)?;
//!     let db = txn.open_database("mail.main", false)?;
//!     db.put(b"key", b"value")?;
//!     txn.commit()?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod env;
mod error;
mod log;
mod txn;

pub use env::{AccessMode, Environment};
pub use error::{basic_error_handler, ErrorCode, ErrorHandler, StorageError, StorageResult};
pub use log::crc32;
pub use txn::{NamedDatabase, ScanOptions, Transaction};

/// Reserved prefix for bookkeeping keys that user-facing scans must skip.
pub const INTERNAL_KEY_PREFIX: &[u8] = b"__internal";

/// Returns true if the key is reserved for internal bookkeeping.
#[must_use]
pub fn is_internal_key(key: &[u8]) -> bool {
    key.starts_with(INTERNAL_KEY_PREFIX)
}
