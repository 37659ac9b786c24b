//! Change replay: streaming committed revisions to consumers.
//!
//! Every consumer has a stable name and a persisted cursor (the last
//! revision it replayed). Replay always resumes from the cursor, so
//! each revision is delivered exactly once per consumer, in ascending
//! order, across restarts.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::key::{Identifier, Key, Revision};
use crate::store::EntityStore;
use pimdb_storage::{AccessMode, Environment, Transaction};
use std::sync::Arc;
use std::time::Duration;

/// Key under which a consumer's cursor is stored.
const CURSOR_KEY: &[u8] = b"cursor";

/// A consumer of committed revisions.
pub trait ReplayConsumer {
    /// Stable name; the cursor database is derived from it.
    fn name(&self) -> &str;

    /// Filter; revisions this returns `false` for still advance the
    /// cursor but are not delivered.
    fn can_replay(&self, entity_type: &str, entity: &Entity) -> bool {
        let _ = (entity_type, entity);
        true
    }

    /// Delivers one revision. The cursor advances only when the
    /// returned job completes successfully.
    fn replay(
        &mut self,
        entity_type: &str,
        id: Identifier,
        revision: Revision,
        entity: &Entity,
    ) -> Job<()>;
}

/// Outcome of one replay drive.
#[derive(Debug, Clone, Copy)]
pub struct ReplayOutcome {
    /// Revisions delivered (or filtered past) this drive.
    pub replayed: usize,
    /// The consumer's cursor afterwards.
    pub cursor: Revision,
    /// True when the cursor reached the maximum revision.
    pub up_to_date: bool,
}

/// Drives one consumer over the committed revision stream.
pub struct ChangeReplay {
    env: Arc<Environment>,
    store: EntityStore,
    consumer: Box<dyn ReplayConsumer>,
    /// Revisions per drive; keeps single event-loop slices short.
    batch_limit: usize,
}

impl ChangeReplay {
    /// Creates a replay driver for a consumer.
    #[must_use]
    pub fn new(env: Arc<Environment>, store: EntityStore, consumer: Box<dyn ReplayConsumer>) -> Self {
        Self {
            env,
            store,
            consumer,
            batch_limit: 64,
        }
    }

    /// Overrides the per-drive batch limit.
    #[must_use]
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// The consumer's name.
    #[must_use]
    pub fn consumer_name(&self) -> &str {
        self.consumer.name()
    }

    /// Mutable access to the consumer (for driving its own queues).
    pub fn consumer_mut(&mut self) -> &mut dyn ReplayConsumer {
        self.consumer.as_mut()
    }

    fn cursor_db_name(&self) -> String {
        format!("synchronizer.cursor.{}", self.consumer.name())
    }

    fn read_cursor(&self, txn: &Transaction<'_>) -> Result<Revision> {
        let db = txn.open_database(&self.cursor_db_name(), false)?;
        match db.get(CURSOR_KEY)? {
            Some(raw) => Revision::from_internal_bytes(&raw),
            None => Ok(Revision::ZERO),
        }
    }

    /// The consumer's persisted cursor.
    pub fn cursor(&self) -> Result<Revision> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        self.read_cursor(&txn)
    }

    fn persist_cursor(&self, revision: Revision) -> Result<()> {
        let txn = self.env.begin(AccessMode::ReadWrite)?;
        let db = txn.open_database(&self.cursor_db_name(), false)?;
        db.put(CURSOR_KEY, &revision.to_internal_bytes())?;
        txn.commit()?;
        Ok(())
    }

    /// True when the consumer has seen every committed revision.
    pub fn all_changes_replayed(&self) -> Result<bool> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        Ok(self.read_cursor(&txn)? >= self.store.max_revision(&txn)?)
    }

    /// Drives replay from the cursor towards the maximum revision.
    ///
    /// At most `batch_limit` revisions are processed per call; call
    /// again until `up_to_date`. On a consumer failure the cursor
    /// stays put and the error propagates; the next `revisionUpdated`
    /// (or a timer) retries from the same spot. Revisions are never
    /// skipped.
    pub fn replay(&mut self) -> Result<ReplayOutcome> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        let max = self.store.max_revision(&txn)?;
        let mut cursor = self.read_cursor(&txn)?;
        let mut replayed = 0usize;

        while cursor < max && replayed < self.batch_limit {
            let next = cursor.next();
            match self.store.revision_target(&txn, next) {
                Ok((entity_type, id)) => {
                    let entity = self
                        .store
                        .read_entity(&txn, &entity_type, Key::new(id, next))
                        .map_err(|error| {
                            if error.is_not_found() {
                                Error::corruption(format!(
                                    "revision {next} recorded but entity version missing"
                                ))
                            } else {
                                error
                            }
                        })?;
                    if self.consumer.can_replay(&entity_type, &entity) {
                        self.consumer
                            .replay(&entity_type, id, next, &entity)
                            .wait_timeout(Duration::from_secs(30))
                            .into_result()?;
                    }
                }
                // The revision was cleaned up below the low-water mark
                // before this consumer registered; nothing to deliver.
                Err(error) if error.is_not_found() => {
                    tracing::trace!(revision = %next, "skipping cleaned-up revision");
                }
                Err(error) => return Err(error),
            }
            self.persist_cursor(next)?;
            cursor = next;
            replayed += 1;
        }

        Ok(ReplayOutcome {
            replayed,
            cursor,
            up_to_date: cursor >= max,
        })
    }
}

impl std::fmt::Debug for ChangeReplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeReplay")
            .field("consumer", &self.consumer.name())
            .field("batch_limit", &self.batch_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{AdaptorRegistry, TypeAdaptor};
    use crate::entity::Operation;
    use pimdb_codec::Value;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    struct Recorder {
        name: String,
        seen: Rc<RefCell<Vec<Revision>>>,
        fail_on: Option<Revision>,
    }

    impl ReplayConsumer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn replay(
            &mut self,
            _entity_type: &str,
            _id: Identifier,
            revision: Revision,
            _entity: &Entity,
        ) -> Job<()> {
            if self.fail_on == Some(revision) {
                return Job::failed(Error::transient("remote unavailable"));
            }
            self.seen.borrow_mut().push(revision);
            Job::ready(())
        }
    }

    fn store() -> EntityStore {
        let mut registry = AdaptorRegistry::new();
        registry.register(TypeAdaptor::new("mail", &["uid"], &["uid"], &["uid"]));
        EntityStore::new(Arc::new(registry))
    }

    fn write_mails(env: &Arc<Environment>, store: &EntityStore, count: usize) {
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        for i in 0..count {
            let mut props = BTreeMap::new();
            props.insert("uid".to_string(), Value::Text(format!("u{i}")));
            store
                .write_entity(
                    &txn,
                    "mail",
                    Identifier::generate(),
                    Operation::Creation,
                    props,
                )
                .unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn replays_each_revision_once_in_order() {
        let env = Environment::open_in_memory("t");
        let store = store();
        write_mails(&env, &store, 5);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut replay = ChangeReplay::new(
            Arc::clone(&env),
            store,
            Box::new(Recorder {
                name: "test".into(),
                seen: Rc::clone(&seen),
                fail_on: None,
            }),
        );

        let outcome = replay.replay().unwrap();
        assert!(outcome.up_to_date);
        assert_eq!(outcome.replayed, 5);
        let revisions: Vec<u64> = seen.borrow().iter().map(|r| r.as_u64()).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4, 5]);

        // Nothing new: nothing delivered twice.
        let outcome = replay.replay().unwrap();
        assert_eq!(outcome.replayed, 0);
        assert_eq!(seen.borrow().len(), 5);
    }

    #[test]
    fn cursor_persists_across_driver_instances() {
        let env = Environment::open_in_memory("t");
        let store = store();
        write_mails(&env, &store, 3);

        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let mut replay = ChangeReplay::new(
                Arc::clone(&env),
                store.clone(),
                Box::new(Recorder {
                    name: "persistent".into(),
                    seen: Rc::clone(&seen),
                    fail_on: None,
                }),
            );
            replay.replay().unwrap();
        }
        write_mails(&env, &store, 2);
        {
            let mut replay = ChangeReplay::new(
                Arc::clone(&env),
                store,
                Box::new(Recorder {
                    name: "persistent".into(),
                    seen: Rc::clone(&seen),
                    fail_on: None,
                }),
            );
            let outcome = replay.replay().unwrap();
            assert_eq!(outcome.replayed, 2);
        }
        let revisions: Vec<u64> = seen.borrow().iter().map(|r| r.as_u64()).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn failure_stops_cursor_without_skipping() {
        let env = Environment::open_in_memory("t");
        let store = store();
        write_mails(&env, &store, 3);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut replay = ChangeReplay::new(
            Arc::clone(&env),
            store,
            Box::new(Recorder {
                name: "flaky".into(),
                seen: Rc::clone(&seen),
                fail_on: Some(Revision::new(2)),
            }),
        );

        assert!(replay.replay().is_err());
        assert_eq!(replay.cursor().unwrap(), Revision::new(1));

        // "Recovers": retry resumes at the failed revision.
        replay.consumer = Box::new(Recorder {
            name: "flaky".into(),
            seen: Rc::clone(&seen),
            fail_on: None,
        });
        let outcome = replay.replay().unwrap();
        assert!(outcome.up_to_date);
        let revisions: Vec<u64> = seen.borrow().iter().map(|r| r.as_u64()).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[test]
    fn batch_limit_bounds_one_drive() {
        let env = Environment::open_in_memory("t");
        let store = store();
        write_mails(&env, &store, 10);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut replay = ChangeReplay::new(
            Arc::clone(&env),
            store,
            Box::new(Recorder {
                name: "batched".into(),
                seen: Rc::clone(&seen),
                fail_on: None,
            }),
        )
        .with_batch_limit(4);

        let outcome = replay.replay().unwrap();
        assert_eq!(outcome.replayed, 4);
        assert!(!outcome.up_to_date);
        let outcome = replay.replay().unwrap();
        assert_eq!(outcome.replayed, 4);
        let outcome = replay.replay().unwrap();
        assert_eq!(outcome.replayed, 2);
        assert!(outcome.up_to_date);
    }

    #[test]
    fn cleaned_revisions_are_passed_over() {
        let env = Environment::open_in_memory("t");
        let store = store();
        let id = Identifier::generate();
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            let mut props = BTreeMap::new();
            props.insert("uid".to_string(), Value::Text("a".into()));
            store
                .write_entity(&txn, "mail", id, Operation::Creation, props.clone())
                .unwrap();
            props.insert("uid".to_string(), Value::Text("b".into()));
            store
                .write_entity(&txn, "mail", id, Operation::Modification, props)
                .unwrap();
            txn.commit().unwrap();
        }
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            store.cleanup_revision(&txn, Revision::new(1)).unwrap();
            txn.commit().unwrap();
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut replay = ChangeReplay::new(
            Arc::clone(&env),
            store,
            Box::new(Recorder {
                name: "late".into(),
                seen: Rc::clone(&seen),
                fail_on: None,
            }),
        );
        let outcome = replay.replay().unwrap();
        assert!(outcome.up_to_date);
        let revisions: Vec<u64> = seen.borrow().iter().map(|r| r.as_u64()).collect();
        assert_eq!(revisions, vec![2]);
    }
}
