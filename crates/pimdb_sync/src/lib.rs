//! # pimdb sync
//!
//! The synchronizer: the component that keeps a resource instance
//! eventually consistent with its remote source.
//!
//! - [`SyncStore`] persists the bidirectional remote-id ↔ local-id
//!   mapping
//! - [`RemoteSource`] is the seam a protocol adapter implements
//! - [`Synchronizer`] schedules sync requests, reconciles fetched
//!   entities against local state and writes local changes back
//!
//! The synchronizer is both a driver (remote fetches become pipeline
//! commands on the synchronizer queue) and a replay consumer (local
//! writes stream back out to the source).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod reconcile;
mod request;
mod source;
mod syncstore;
mod synchronizer;

pub use error::{SyncError, SyncResult};
pub use reconcile::Reconciler;
pub use request::{SyncRequest, SyncRequestKind};
pub use source::RemoteSource;
pub use syncstore::SyncStore;
pub use synchronizer::Synchronizer;
