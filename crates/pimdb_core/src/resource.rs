//! One resource instance: storage, pipeline, replay and notification
//! wiring, driven by a cooperative event loop.

use crate::adaptor::AdaptorRegistry;
use crate::commands::Command;
use crate::error::{Error, ErrorKind, Result};
use crate::key::Revision;
use crate::notifier::{Notification, Notifier};
use crate::pipeline::{Pipeline, QueueKind};
use crate::query::Query;
use crate::replay::{ChangeReplay, ReplayConsumer};
use crate::store::EntityStore;
use pimdb_storage::{AccessMode, Environment};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A single configured account bound to one local database directory.
///
/// The resource is single-threaded and cooperative: callers enqueue
/// commands and repeatedly call [`Resource::step`] (or
/// [`Resource::process_events`]) to drain queues, advance replay
/// consumers, complete flushes and garbage-collect old revisions.
pub struct Resource {
    instance_id: String,
    path: PathBuf,
    env: Arc<Environment>,
    store: EntityStore,
    notifier: Arc<Notifier>,
    pipeline: RefCell<Pipeline>,
    consumers: RefCell<Vec<ChangeReplay>>,
    pending_flushes: RefCell<Vec<(String, Revision)>>,
    /// Lowest revision any client still needs, as declared via
    /// `RevisionReplayed`; `None` until a client declares one.
    client_lower_bound: Cell<Option<Revision>>,
    last_cleaned: Cell<Revision>,
    last_error: RefCell<Option<(ErrorKind, String)>>,
    shutdown: Cell<bool>,
    sync_request_handler: RefCell<Option<Box<dyn Fn(Query)>>>,
}

impl Resource {
    /// Opens (or creates) the resource instance under
    /// `<storage_root>/<instance_id>/`.
    pub fn open(
        storage_root: &Path,
        instance_id: &str,
        registry: Arc<AdaptorRegistry>,
    ) -> Result<Resource> {
        let path = storage_root.join(instance_id);
        let env = Environment::open(&path, AccessMode::ReadWrite)?;
        let store = EntityStore::new(registry);
        let pipeline = Pipeline::open(Arc::clone(&env), store.clone(), &path)?;
        Ok(Resource {
            instance_id: instance_id.to_string(),
            path,
            env,
            store,
            notifier: Arc::new(Notifier::new()),
            pipeline: RefCell::new(pipeline),
            consumers: RefCell::new(Vec::new()),
            pending_flushes: RefCell::new(Vec::new()),
            client_lower_bound: Cell::new(None),
            last_cleaned: Cell::new(Revision::ZERO),
            last_error: RefCell::new(None),
            shutdown: Cell::new(false),
            sync_request_handler: RefCell::new(None),
        })
    }

    /// The instance identifier.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The shared storage environment.
    #[must_use]
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// The entity store.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// The notification channel.
    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Registers a replay consumer; its cursor resumes from storage.
    pub fn register_consumer(&self, consumer: Box<dyn ReplayConsumer>) {
        self.consumers.borrow_mut().push(ChangeReplay::new(
            Arc::clone(&self.env),
            self.store.clone(),
            consumer,
        ));
    }

    /// Routes `SynchronizeRequest` commands to the synchronizer.
    pub fn set_sync_request_handler(&self, handler: Box<dyn Fn(Query)>) {
        *self.sync_request_handler.borrow_mut() = Some(handler);
    }

    /// Appends a command; durable before return.
    ///
    /// # Errors
    ///
    /// A resource in a corruption state accepts no further writes.
    pub fn enqueue_command(&self, queue: QueueKind, command: &Command) -> Result<()> {
        if let Some((ErrorKind::Corruption, message)) = &*self.last_error.borrow() {
            return Err(Error::corruption(format!(
                "resource {} is errored: {message}",
                self.instance_id
            )));
        }
        self.pipeline.borrow_mut().enqueue(queue, command)
    }

    /// Runs one cooperative slice: at most one pipeline step plus one
    /// bounded replay batch per consumer. Returns true when work
    /// remains.
    pub fn step(&self) -> Result<bool> {
        let outcome = {
            let mut pipeline = self.pipeline.borrow_mut();
            match pipeline.step() {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.record_error(&error);
                    return Err(error);
                }
            }
        };

        if let Some(revision) = outcome.committed_revision {
            self.notifier.emit(&Notification::RevisionUpdated(revision));
        }
        self.pending_flushes
            .borrow_mut()
            .extend(outcome.flushes.into_iter());
        if let Some(revision) = outcome.revision_replayed {
            let updated = match self.client_lower_bound.get() {
                Some(prev) => prev.max(revision),
                None => revision,
            };
            self.client_lower_bound.set(Some(updated));
        }
        if outcome.shutdown_requested {
            self.shutdown.set(true);
        }
        for query in outcome.sync_requests {
            if let Some(handler) = &*self.sync_request_handler.borrow() {
                handler(query);
            } else {
                tracing::warn!(
                    resource = %self.instance_id,
                    "synchronize request with no synchronizer attached"
                );
            }
        }

        let replay_pending = self.drive_consumers();
        self.complete_flushes()?;
        self.cleanup()?;

        let drained = outcome.drained && self.pipeline.borrow().is_drained();
        if drained && !replay_pending {
            self.notifier.emit(&Notification::PipelinesDrained);
        }
        Ok(!drained || replay_pending)
    }

    /// Drains queues and replay consumers completely.
    pub fn process_events(&self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Advances every consumer by one bounded batch. Returns true if
    /// any consumer still lags.
    fn drive_consumers(&self) -> bool {
        let mut pending = false;
        for replay in self.consumers.borrow_mut().iter_mut() {
            match replay.replay() {
                Ok(outcome) => {
                    if !outcome.up_to_date {
                        pending = true;
                    }
                }
                Err(error) => {
                    // The cursor stays put; retried on the next step.
                    tracing::warn!(
                        consumer = replay.consumer_name(),
                        "replay failed: {error}"
                    );
                    self.notifier.emit(&Notification::Error {
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                }
            }
        }
        pending
    }

    /// The lowest cursor over all registered consumers; `None` without
    /// consumers.
    fn min_consumer_cursor(&self) -> Result<Option<Revision>> {
        let consumers = self.consumers.borrow();
        let mut min: Option<Revision> = None;
        for replay in consumers.iter() {
            let cursor = replay.cursor()?;
            min = Some(match min {
                Some(current) => current.min(cursor),
                None => cursor,
            });
        }
        Ok(min)
    }

    fn complete_flushes(&self) -> Result<()> {
        let gate = match self.min_consumer_cursor()? {
            Some(cursor) => cursor,
            // Without consumers a flush completes at commit.
            None => {
                let txn = self.env.begin(AccessMode::ReadOnly)?;
                self.store.max_revision(&txn)?
            }
        };
        let completed: Vec<String> = {
            let mut pending = self.pending_flushes.borrow_mut();
            let (done, waiting): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(_, revision)| *revision <= gate);
            *pending = waiting;
            done.into_iter().map(|(flush_id, _)| flush_id).collect()
        };
        for flush_id in completed {
            self.notifier
                .emit(&Notification::FlushComplete { flush_id });
        }
        Ok(())
    }

    /// Removes superseded versions below the low-water mark.
    ///
    /// The mark is the minimum of all consumer cursors and the lowest
    /// client-declared revision, minus a margin of one so no cursor
    /// can cross a removed revision.
    fn cleanup(&self) -> Result<()> {
        let Some(mut low_water) = self.min_consumer_cursor()? else {
            // No consumers: clients alone gate cleanup.
            return self.cleanup_to(self.client_lower_bound.get());
        };
        if let Some(client) = self.client_lower_bound.get() {
            low_water = low_water.min(client);
        }
        self.cleanup_to(Some(low_water))
    }

    fn cleanup_to(&self, low_water: Option<Revision>) -> Result<()> {
        let Some(low_water) = low_water else {
            return Ok(());
        };
        // Margin of one below the mark.
        let limit = Revision::new(low_water.as_u64().saturating_sub(1));
        let mut cleaned = self.last_cleaned.get();
        let pipeline = self.pipeline.borrow();
        while cleaned < limit {
            cleaned = cleaned.next();
            pipeline.cleanup_revision(cleaned)?;
        }
        self.last_cleaned.set(cleaned);
        Ok(())
    }

    /// Declares a client's replay low-water mark directly (the façade
    /// sends `RevisionReplayed` through the queue; the query runner
    /// may also report it after an incremental drain).
    pub fn note_revision_replayed(&self, revision: Revision) -> Result<()> {
        self.enqueue_command(QueueKind::User, &Command::RevisionReplayed { revision })
    }

    /// The latest surfaced fatal error.
    #[must_use]
    pub fn error(&self) -> Option<(ErrorKind, String)> {
        self.last_error.borrow().clone()
    }

    fn record_error(&self, error: &Error) {
        *self.last_error.borrow_mut() = Some((error.kind(), error.to_string()));
        self.notifier.emit(&Notification::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// True once a shutdown command was processed.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.get()
    }

    /// The resource's maximum committed revision.
    pub fn max_revision(&self) -> Result<Revision> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        self.store.max_revision(&txn)
    }

    /// Deletes the instance's environment and queues from disk.
    ///
    /// The shared environment is closed on last release; a later
    /// [`Resource::open`] starts fresh.
    pub fn remove_data_from_disk(storage_root: &Path, instance_id: &str) -> Result<()> {
        let path = storage_root.join(instance_id);
        Environment::remove_from_disk(&path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("instance_id", &self.instance_id)
            .field("path", &self.path)
            .field("consumers", &self.consumers.borrow().len())
            .finish_non_exhaustive()
    }
}
