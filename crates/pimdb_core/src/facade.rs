//! The client-facing store façade.
//!
//! Applications talk to resources through [`Store`]: typed
//! create/modify/remove, query loading into a result model, and the
//! flush protocol for observing that writes went live.

use crate::commands::Command;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::key::Identifier;
use crate::notifier::Notification;
use crate::pipeline::QueueKind;
use crate::provider::{ModelResult, ProviderEvent, ResultProvider};
use crate::query::Query;
use crate::resource::Resource;
use crate::runner::QueryRunner;
use pimdb_codec::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

/// Client-side handle over one or more resource instances.
///
/// Runs in the application's loop; all writes travel through the
/// resources' user message queues, reads use snapshots of the shared
/// environments.
#[derive(Default)]
pub struct Store {
    resources: RefCell<Vec<Rc<Resource>>>,
    flush_counter: RefCell<u64>,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a resource instance.
    pub fn attach_resource(&self, resource: Rc<Resource>) {
        self.resources.borrow_mut().push(resource);
    }

    /// The attached resource with the given instance id.
    #[must_use]
    pub fn resource(&self, instance_id: &str) -> Option<Rc<Resource>> {
        self.resources
            .borrow()
            .iter()
            .find(|r| r.instance_id() == instance_id)
            .cloned()
    }

    fn require_resource(&self, instance_id: &str) -> Result<Rc<Resource>> {
        self.resource(instance_id)
            .ok_or_else(|| Error::misconfiguration(format!("no such resource: {instance_id}")))
    }

    /// Creates an entity; the returned job completes once the command
    /// is durably enqueued. The new id is the job's value.
    pub fn create(
        &self,
        resource_id: &str,
        entity_type: &str,
        properties: BTreeMap<String, Value>,
    ) -> Job<Identifier> {
        let id = Identifier::generate();
        let command = Command::Create {
            entity_type: entity_type.to_string(),
            id,
            properties,
        };
        match self
            .require_resource(resource_id)
            .and_then(|r| r.enqueue_command(QueueKind::User, &command))
        {
            Ok(()) => Job::ready(id),
            Err(error) => Job::failed(error),
        }
    }

    /// Modifies an entity (merge semantics; `Null` deletes a
    /// property).
    pub fn modify(
        &self,
        resource_id: &str,
        entity_type: &str,
        id: Identifier,
        properties: BTreeMap<String, Value>,
    ) -> Job<()> {
        let command = Command::Modify {
            entity_type: entity_type.to_string(),
            id,
            properties,
        };
        self.enqueue_job(resource_id, command)
    }

    /// Removes an entity (terminal).
    pub fn remove(&self, resource_id: &str, entity_type: &str, id: Identifier) -> Job<()> {
        let command = Command::Delete {
            entity_type: entity_type.to_string(),
            id,
        };
        self.enqueue_job(resource_id, command)
    }

    fn enqueue_job(&self, resource_id: &str, command: Command) -> Job<()> {
        match self
            .require_resource(resource_id)
            .and_then(|r| r.enqueue_command(QueueKind::User, &command))
        {
            Ok(()) => Job::ready(()),
            Err(error) => Job::failed(error),
        }
    }

    /// Loads a query into a result model.
    ///
    /// The query's `resources` list selects which attached instances
    /// participate; an empty list loads nothing (the model still
    /// completes with `children_fetched`). Live queries stay
    /// subscribed; drive them with [`ResultModel::process_updates`].
    pub fn load(&self, query: Query) -> Result<ResultModel> {
        let mut model = ModelResult::new();
        let mut runners = Vec::new();

        for resource_id in &query.resources {
            let Some(resource) = self.resource(resource_id) else {
                tracing::warn!(resource = %resource_id, "query names an unattached resource");
                continue;
            };
            // Subscribe before reading the snapshot so no revision can
            // fall between the baseline and the live stream.
            let mut runner = QueryRunner::new(
                std::sync::Arc::clone(resource.env()),
                resource.store().clone(),
                query.clone(),
                resource.notifier(),
            );
            runner.run_initial(&mut model)?;
            if let Some(revision) = runner.take_replayed_up_to() {
                resource.note_revision_replayed(revision)?;
            }
            runners.push((resource, runner));
        }

        model.set_children_fetched(true);
        Ok(ResultModel {
            model,
            runners,
            cancelled: false,
        })
    }

    /// Asks a resource to synchronize with its remote source.
    pub fn synchronize(&self, resource_id: &str, query: Query) -> Job<()> {
        self.enqueue_job(resource_id, Command::SynchronizeRequest { query })
    }

    /// Submits a flush token to each named resource's user queue and
    /// returns the token. `FlushComplete` notifications carry it back
    /// once every consumer advanced past the flushed writes.
    pub fn flush_message_queue(&self, resource_ids: &[&str]) -> Result<String> {
        let flush_id = {
            let mut counter = self.flush_counter.borrow_mut();
            *counter += 1;
            format!("flush-{counter}")
        };
        for resource_id in resource_ids {
            self.require_resource(resource_id)?.enqueue_command(
                QueueKind::User,
                &Command::Flush {
                    flush_id: flush_id.clone(),
                },
            )?;
        }
        Ok(flush_id)
    }

    /// Sends a shutdown command to a resource.
    pub fn shutdown(&self, resource_id: &str) -> Job<()> {
        self.enqueue_job(resource_id, Command::Shutdown)
    }

    /// Drives every attached resource until drained.
    pub fn process_events(&self) -> Result<()> {
        for resource in self.resources.borrow().iter() {
            resource.process_events()?;
        }
        Ok(())
    }

    /// Drives resources until a flush token is observed complete.
    pub fn wait_for_flush(
        &self,
        subscription: &Receiver<Notification>,
        flush_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events()?;
            while let Ok(notification) = subscription.try_recv() {
                if matches!(&notification, Notification::FlushComplete { flush_id: done } if done == flush_id)
                {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::transient(format!(
                    "flush {flush_id} did not complete in time"
                )));
            }
            std::thread::yield_now();
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("resources", &self.resources.borrow().len())
            .finish_non_exhaustive()
    }
}

/// A loaded query result: the model plus its live runners.
///
/// The model owns the runners; dropping the result cancels the live
/// query (the notification subscriptions go with it).
pub struct ResultModel {
    model: ModelResult,
    runners: Vec<(Rc<Resource>, QueryRunner)>,
    cancelled: bool,
}

impl ResultModel {
    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.model.row_count()
    }

    /// Rows in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.model.entities()
    }

    /// The row at `index`.
    #[must_use]
    pub fn entity_at(&self, index: usize) -> Option<&Entity> {
        self.model.entity_at(index)
    }

    /// The row for `id`.
    #[must_use]
    pub fn entity(&self, id: Identifier) -> Option<&Entity> {
        self.model.entity(id)
    }

    /// Whether the initial load completed.
    #[must_use]
    pub fn children_fetched(&self) -> bool {
        self.model.children_fetched()
    }

    /// Accumulated provider events.
    #[must_use]
    pub fn events(&self) -> &[ProviderEvent] {
        self.model.events()
    }

    /// Drains the event log.
    pub fn take_events(&mut self) -> Vec<ProviderEvent> {
        self.model.take_events()
    }

    /// Expands a tree node: loads the children of `parent`.
    pub fn fetch_more(&mut self, parent: Identifier) -> Result<()> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        for (_, runner) in &mut self.runners {
            runner.fetch_children(parent, &mut self.model)?;
        }
        Ok(())
    }

    /// Drains pending live updates into the model. Returns the number
    /// of emitted events.
    pub fn process_updates(&mut self) -> Result<usize> {
        if self.cancelled {
            return Ok(0);
        }
        let mut emitted = 0;
        for (resource, runner) in &mut self.runners {
            emitted += runner.process_notifications(&mut self.model)?;
            if let Some(revision) = runner.take_replayed_up_to() {
                resource.note_revision_replayed(revision)?;
            }
        }
        Ok(emitted)
    }

    /// Cancels the live query; in-flight updates are discarded at the
    /// next yield point and no further events are emitted.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.runners.clear();
    }
}

impl std::fmt::Debug for ResultModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultModel")
            .field("rows", &self.model.row_count())
            .field("live_runners", &self.runners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{AdaptorRegistry, TypeAdaptor};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn registry() -> Arc<AdaptorRegistry> {
        let mut registry = AdaptorRegistry::new();
        registry.register(TypeAdaptor::new(
            "mail",
            &["uid", "subject", "sender", "folder"],
            &["uid", "folder"],
            &["uid", "subject", "sender"],
        ));
        Arc::new(registry)
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::Text((*v).to_string())))
            .collect()
    }

    #[test]
    fn create_and_query_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::new();
        store.attach_resource(Rc::new(
            Resource::open(dir.path(), "r1", registry()).unwrap(),
        ));

        let job = store.create("r1", "mail", props(&[("subject", "hello")]));
        assert!(job.wait().is_ok());
        store.process_events().unwrap();

        let model = store
            .load(Query::of_type("mail").resource("r1"))
            .unwrap();
        assert_eq!(model.row_count(), 1);
        assert!(model.children_fetched());
    }

    #[test]
    fn query_with_no_resources_is_empty_but_complete() {
        let store = Store::new();
        let model = store.load(Query::of_type("mail")).unwrap();
        assert_eq!(model.row_count(), 0);
        assert!(model.children_fetched());
    }

    #[test]
    fn unknown_resource_fails_writes() {
        let store = Store::new();
        let job = store.create("nope", "mail", props(&[]));
        assert!(!job.wait().is_ok());
    }

    #[test]
    fn flush_round_trips_through_pipeline_and_replay() {
        let dir = tempdir().unwrap();
        let store = Store::new();
        let resource = Rc::new(Resource::open(dir.path(), "r1", registry()).unwrap());
        let subscription = resource.notifier().subscribe();
        store.attach_resource(resource);

        store
            .create("r1", "mail", props(&[("uid", "u1")]))
            .wait()
            .into_result()
            .unwrap();
        let flush_id = store.flush_message_queue(&["r1"]).unwrap();
        store
            .wait_for_flush(&subscription, &flush_id, Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn cancelled_model_emits_nothing() {
        let dir = tempdir().unwrap();
        let store = Store::new();
        store.attach_resource(Rc::new(
            Resource::open(dir.path(), "r1", registry()).unwrap(),
        ));

        let mut model = store
            .load(Query::of_type("mail").resource("r1").live(true))
            .unwrap();
        model.cancel();

        store
            .create("r1", "mail", props(&[("uid", "u1")]))
            .wait()
            .into_result()
            .unwrap();
        store.process_events().unwrap();
        assert_eq!(model.process_updates().unwrap(), 0);
        assert_eq!(model.row_count(), 0);
    }
}
