//! The synchronizer: request scheduling, status and write-back.

use crate::error::{SyncError, SyncResult};
use crate::reconcile::Reconciler;
use crate::request::{merge_into_queue, SyncRequest, SyncRequestKind};
use crate::source::RemoteSource;
use crate::syncstore::SyncStore;
use pimdb_core::{
    Command, Entity, Identifier, Job, Notification, Query, QueueKind, ReplayConsumer, Resource,
    Revision, Status,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// Drives one resource's synchronization with its remote source.
///
/// Incoming `SynchronizeRequest` commands expand into a deduplicated
/// request queue which [`Synchronizer::process_sync_queue`] drains
/// serially, reporting `Idle → Busy → Idle | Error` transitions per
/// request. Local writes flow back to the source through the
/// registered write-back replay consumer.
pub struct Synchronizer<S: RemoteSource + 'static> {
    resource: Rc<Resource>,
    sync_store: SyncStore,
    source: Rc<RefCell<S>>,
    queue: Rc<RefCell<VecDeque<SyncRequest>>>,
    status: RefCell<Status>,
}

impl<S: RemoteSource + 'static> Synchronizer<S> {
    /// Wires a source to a resource: registers the write-back
    /// consumer and routes synchronize requests into the queue.
    pub fn attach(resource: Rc<Resource>, source: S) -> Synchronizer<S> {
        let sync_store = SyncStore::new(Arc::clone(resource.env()));
        let source = Rc::new(RefCell::new(source));
        let queue = Rc::new(RefCell::new(VecDeque::new()));

        resource.register_consumer(Box::new(WriteBack {
            source: Rc::clone(&source),
            sync_store: sync_store.clone(),
        }));

        let synchronizer = Synchronizer {
            resource: Rc::clone(&resource),
            sync_store,
            source,
            queue: Rc::clone(&queue),
            status: RefCell::new(Status::Idle),
        };

        let router_queue = Rc::clone(&queue);
        let router_source = Rc::clone(&synchronizer.source);
        resource.set_sync_request_handler(Box::new(move |query: Query| {
            let requests = router_source.borrow().get_sync_requests(&query);
            let mut queue = router_queue.borrow_mut();
            for request in requests {
                merge_into_queue(request, &mut queue);
            }
        }));

        synchronizer
    }

    /// The synchronizer's private storage.
    #[must_use]
    pub fn sync_store(&self) -> &SyncStore {
        &self.sync_store
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Schedules a synchronization directly (bypassing the command
    /// queue); deduplicated like any other request.
    pub fn synchronize(&self, query: &Query) {
        let requests = self.source.borrow().get_sync_requests(query);
        let mut queue = self.queue.borrow_mut();
        for request in requests {
            merge_into_queue(request, &mut queue);
        }
    }

    /// Number of queued requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Drains the request queue serially.
    ///
    /// Each request runs to completion (or failure) before the next
    /// starts; a failed request leaves local state untouched beyond
    /// what its reconciler already enqueued, reports an error status,
    /// and does not block later requests. Returns the first error.
    pub fn process_sync_queue(&self) -> SyncResult<()> {
        let mut first_error: Option<SyncError> = None;

        loop {
            let Some(request) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            let result = self.process_request(&request);
            match result {
                Ok(()) => self.set_status(Status::Idle, "request complete", &request),
                Err(error) => {
                    tracing::warn!(kind = ?request.kind, "sync request failed: {error}");
                    self.resource.notifier().emit(&Notification::Error {
                        kind: pimdb_core::ErrorKind::Transient,
                        message: error.to_string(),
                    });
                    self.set_status(Status::Error, &error.to_string(), &request);
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn process_request(&self, request: &SyncRequest) -> SyncResult<()> {
        match request.kind {
            SyncRequestKind::Synchronization => {
                self.set_status(Status::Busy, "synchronizing with source", request);
                let mut reconciler = Reconciler::new(&self.resource, &self.sync_store);
                self.source
                    .borrow_mut()
                    .synchronize_with_source(&request.query, &mut reconciler)?;
                // Apply the commands the reconciler enqueued.
                self.resource.process_events().map_err(SyncError::from)?;
                Ok(())
            }
            SyncRequestKind::ChangeReplay => {
                self.set_status(Status::Busy, "replaying local changes", request);
                // The write-back consumer advances inside the event
                // loop; one drain is one push attempt.
                self.resource.process_events().map_err(SyncError::from)?;
                Ok(())
            }
            SyncRequestKind::Flush => {
                let flush_id = request
                    .request_id
                    .clone()
                    .unwrap_or_else(|| "sync-flush".to_string());
                self.resource
                    .enqueue_command(QueueKind::Synchronizer, &Command::Flush { flush_id })
                    .map_err(SyncError::from)?;
                self.resource.process_events().map_err(SyncError::from)?;
                Ok(())
            }
        }
    }

    fn set_status(&self, status: Status, message: &str, request: &SyncRequest) {
        *self.status.borrow_mut() = status;
        self.resource.notifier().emit(&Notification::Status {
            status,
            message: message.to_string(),
            request_id: request.request_id.clone(),
        });
    }
}

impl<S: RemoteSource + 'static> std::fmt::Debug for Synchronizer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("pending_requests", &self.queue.borrow().len())
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Replay consumer that pushes committed local writes to the source.
struct WriteBack<S: RemoteSource> {
    source: Rc<RefCell<S>>,
    sync_store: SyncStore,
}

impl<S: RemoteSource> ReplayConsumer for WriteBack<S> {
    fn name(&self) -> &str {
        "writeback"
    }

    fn can_replay(&self, _entity_type: &str, entity: &Entity) -> bool {
        // Versions that originated at the source are not echoed back.
        !entity.metadata.replayed_to_source
    }

    fn replay(
        &mut self,
        entity_type: &str,
        id: Identifier,
        _revision: Revision,
        entity: &Entity,
    ) -> Job<()> {
        let old_remote = match self.sync_store.resolve_local_id(entity_type, id) {
            Ok(remote) => remote,
            Err(error) => return Job::failed(pimdb_core::Error::transient(error.to_string())),
        };

        let result = self.source.borrow_mut().replay_change(
            entity_type,
            entity,
            entity.operation(),
            old_remote.as_deref(),
        );

        match result {
            Ok(new_remote) => {
                let update = || -> SyncResult<()> {
                    match (&old_remote, &new_remote) {
                        (Some(old), Some(new)) if old != new => {
                            self.sync_store.remove_remote_id(entity_type, id, old)?;
                            self.sync_store.record_remote_id(entity_type, id, new)?;
                        }
                        (None, Some(new)) => {
                            self.sync_store.record_remote_id(entity_type, id, new)?;
                        }
                        (Some(old), None) => {
                            self.sync_store.remove_remote_id(entity_type, id, old)?;
                        }
                        _ => {}
                    }
                    Ok(())
                };
                match update() {
                    Ok(()) => Job::ready(()),
                    Err(error) => {
                        Job::failed(pimdb_core::Error::transient(error.to_string()))
                    }
                }
            }
            Err(error) => Job::failed(pimdb_core::Error::transient(error.to_string())),
        }
    }
}
