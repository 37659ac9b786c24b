//! # pimdb core
//!
//! The local synchronization and query core of an offline-first PIM
//! data engine, per resource instance:
//!
//! - Key/revision model: stable 128-bit identifiers plus a global,
//!   monotonically increasing revision per committed write
//! - Entity store: revisioned entity buffers with secondary indexes on
//!   an ordered key/value environment
//! - Command pipeline: durable message queues drained through ordered
//!   preprocessors into committed revisions
//! - Change replay: per-consumer cursors streaming committed revisions
//!   to live queries and the synchronizer, resumable across restarts
//! - Query engine: index-driven initial result sets plus incremental
//!   live updates that never miss or duplicate a revision
//!
//! The companion crates provide the storage backend (`pimdb_storage`),
//! the buffer codec (`pimdb_codec`) and the remote synchronizer
//! (`pimdb_sync`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adaptor;
mod commands;
mod entity;
mod error;
mod facade;
mod index;
mod job;
mod key;
mod notifier;
mod pipeline;
mod provider;
mod query;
mod queue;
mod replay;
mod resource;
mod runner;
mod store;

pub use adaptor::{AdaptorRegistry, TypeAdaptor};
pub use commands::{Command, CommandId};
pub use entity::{Entity, Metadata, Operation};
pub use error::{Error, ErrorKind, Result};
pub use facade::{ResultModel, Store};
pub use index::IndexLookup;
pub use job::{Job, JobCompleter, JobResult};
pub use key::{Identifier, Key, Revision};
pub use notifier::{Notification, Notifier, Status};
pub use pipeline::{CommandState, Pipeline, Preprocessor, PreprocessorContext, QueueKind};
pub use provider::{ModelResult, ProviderEvent, ResultProvider};
pub use query::{Comparator, Query};
pub use queue::MessageQueue;
pub use replay::{ChangeReplay, ReplayConsumer, ReplayOutcome};
pub use resource::Resource;
pub use runner::QueryRunner;
pub use store::EntityStore;
