//! The command pipeline: queues in, committed revisions out.
//!
//! A command moves through `Queued → Decoding → Preprocessing(i) →
//! CommitScheduled → Committed → Notified`; any failure parks it in
//! `Failed(kind)` without taking the rest of the step down. Commands
//! drained in one step share one write transaction; when a command
//! fails, the transaction is aborted and the step restarts without it
//! (preprocessors are pure, so re-running the survivors is safe).

use crate::commands::Command;
use crate::entity::{Entity, Operation};
use crate::error::{Error, ErrorKind, Result};
use crate::key::{Identifier, Key, Revision};
use crate::query::Query;
use crate::queue::MessageQueue;
use crate::store::EntityStore;
use pimdb_storage::{AccessMode, Environment, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Which queue a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Client commands; has priority.
    User,
    /// Commands produced by the synchronizer.
    Synchronizer,
}

/// Lifecycle of a command inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Waiting in a queue.
    Queued,
    /// Payload being decoded.
    Decoding,
    /// Running preprocessor `i`.
    Preprocessing(usize),
    /// Waiting for the step's commit.
    CommitScheduled,
    /// Durable.
    Committed,
    /// Subscribers were notified.
    Notified,
    /// Terminally failed; the queue position was given up.
    Failed(ErrorKind),
}

/// Context handed to preprocessors.
pub struct PreprocessorContext<'a> {
    /// The store, for reads against the shared transaction.
    pub store: &'a EntityStore,
    /// Which queue the command came from.
    pub queue: QueueKind,
}

/// Ordered, pure enrichment step for freshly written versions.
///
/// Preprocessors may read from and write to the shared transaction and
/// mutate the entity's properties; they must be idempotent and must
/// not observe other commands of the same step.
pub trait Preprocessor {
    /// Stable identifier for logs.
    fn id(&self) -> &str;

    /// Processes one entity version.
    fn process(
        &self,
        context: &PreprocessorContext<'_>,
        entity: &mut Entity,
        txn: &Transaction<'_>,
    ) -> Result<()>;
}

/// Outcome of one pipeline step.
#[derive(Default)]
pub struct StepOutcome {
    /// Highest revision after the step's commit, when entities were
    /// written.
    pub committed_revision: Option<Revision>,
    /// Flush tokens committed this step, with the revision every
    /// consumer must pass for the flush to complete.
    pub flushes: Vec<(String, Revision)>,
    /// Both queues were empty; nothing happened.
    pub drained: bool,
    /// Final state of each drained command.
    pub command_states: Vec<(QueueKind, CommandState)>,
    /// Synchronize requests routed to the synchronizer.
    pub sync_requests: Vec<Query>,
    /// Client-declared replay low-water mark, when received.
    pub revision_replayed: Option<Revision>,
    /// A shutdown command was received.
    pub shutdown_requested: bool,
}

/// What a single pass over the batch produced.
#[derive(Default)]
struct PassResult {
    wrote_entities: bool,
    flush_ids: Vec<String>,
    sync_requests: Vec<Query>,
    revision_replayed: Option<Revision>,
    shutdown_requested: bool,
}

/// The write path of one resource instance.
pub struct Pipeline {
    env: Arc<Environment>,
    store: EntityStore,
    user_queue: MessageQueue,
    sync_queue: MessageQueue,
    preprocessors: HashMap<(String, i64), Vec<Box<dyn Preprocessor>>>,
}

impl Pipeline {
    /// Creates a pipeline over durable queues in `queue_dir`.
    pub fn open(env: Arc<Environment>, store: EntityStore, queue_dir: &Path) -> Result<Self> {
        let user_queue = MessageQueue::open(&queue_dir.join("queue.user.log"), "user")?;
        let sync_queue = MessageQueue::open(&queue_dir.join("queue.sync.log"), "sync")?;
        Ok(Self {
            env,
            store,
            user_queue,
            sync_queue,
            preprocessors: HashMap::new(),
        })
    }

    /// The entity store the pipeline writes through.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Registers the preprocessor chain for a type and operation.
    pub fn set_preprocessors(
        &mut self,
        entity_type: &str,
        operation: Operation,
        chain: Vec<Box<dyn Preprocessor>>,
    ) {
        self.preprocessors
            .insert((entity_type.to_string(), operation.to_code()), chain);
    }

    /// Appends a command to a queue; durable before return.
    pub fn enqueue(&mut self, queue: QueueKind, command: &Command) -> Result<()> {
        let payload = command.encode_payload()?;
        let target = match queue {
            QueueKind::User => &mut self.user_queue,
            QueueKind::Synchronizer => &mut self.sync_queue,
        };
        target.enqueue(command.id() as u32, &payload)
    }

    /// True when both queues are empty.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.user_queue.is_empty() && self.sync_queue.is_empty()
    }

    /// Processes at most one command per queue, user queue first.
    ///
    /// All drained commands share one write transaction; the step
    /// commits once every surviving command is processed.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::default();

        let mut batch: Vec<(QueueKind, u32, Vec<u8>)> = Vec::with_capacity(2);
        if let Some((id, payload)) = self.user_queue.dequeue() {
            batch.push((QueueKind::User, id, payload));
        }
        if let Some((id, payload)) = self.sync_queue.dequeue() {
            batch.push((QueueKind::Synchronizer, id, payload));
        }
        if batch.is_empty() {
            outcome.drained = true;
            return Ok(outcome);
        }

        let mut states: Vec<CommandState> = vec![CommandState::Queued; batch.len()];
        let mut excluded = vec![false; batch.len()];

        // Re-run the batch without the failed command until a pass
        // commits. Bounded by the batch size.
        loop {
            let txn = self.env.begin(AccessMode::ReadWrite)?;
            let mut pass = PassResult::default();
            let mut failure: Option<usize> = None;

            for (i, (queue, raw_id, payload)) in batch.iter().enumerate() {
                if excluded[i] {
                    continue;
                }
                match self.process_one(&txn, *queue, *raw_id, payload, &mut pass, &mut states[i]) {
                    Ok(()) => states[i] = CommandState::CommitScheduled,
                    Err(error) => {
                        tracing::warn!(
                            queue = ?queue,
                            state = ?states[i],
                            "pipeline command failed: {error}"
                        );
                        states[i] = CommandState::Failed(error.kind());
                        failure = Some(i);
                        break;
                    }
                }
            }

            if let Some(i) = failure {
                txn.flag_error();
                drop(txn);
                excluded[i] = true;
                continue;
            }

            let max_revision = self.store.max_revision(&txn)?;
            txn.commit()?;

            for state in &mut states {
                if *state == CommandState::CommitScheduled {
                    *state = CommandState::Committed;
                }
            }
            if pass.wrote_entities {
                outcome.committed_revision = Some(max_revision);
            }
            outcome.flushes = pass
                .flush_ids
                .into_iter()
                .map(|id| (id, max_revision))
                .collect();
            outcome.sync_requests = pass.sync_requests;
            outcome.revision_replayed = pass.revision_replayed;
            outcome.shutdown_requested = pass.shutdown_requested;
            break;
        }

        // Rotation: persist the consumed queue positions.
        self.user_queue.sync_state()?;
        self.sync_queue.sync_state()?;

        outcome.command_states = batch
            .iter()
            .map(|(queue, _, _)| *queue)
            .zip(states)
            .collect();
        Ok(outcome)
    }

    fn process_one(
        &self,
        txn: &Transaction<'_>,
        queue: QueueKind,
        raw_id: u32,
        payload: &[u8],
        pass: &mut PassResult,
        state: &mut CommandState,
    ) -> Result<()> {
        *state = CommandState::Decoding;
        let command = Command::decode(raw_id, payload)?;

        match command {
            Command::Create {
                entity_type,
                id,
                properties,
            } => self.apply_entity_command(
                txn,
                queue,
                &entity_type,
                id,
                Operation::Creation,
                properties,
                pass,
                state,
            ),
            Command::Modify {
                entity_type,
                id,
                properties,
            } => self.apply_entity_command(
                txn,
                queue,
                &entity_type,
                id,
                Operation::Modification,
                properties,
                pass,
                state,
            ),
            Command::Delete { entity_type, id } => self.apply_entity_command(
                txn,
                queue,
                &entity_type,
                id,
                Operation::Removal,
                BTreeMap::new(),
                pass,
                state,
            ),
            Command::Flush { flush_id } => {
                pass.flush_ids.push(flush_id);
                Ok(())
            }
            Command::RevisionReplayed { revision } => {
                pass.revision_replayed = Some(
                    pass.revision_replayed
                        .map_or(revision, |prev| prev.max(revision)),
                );
                Ok(())
            }
            Command::SynchronizeRequest { query } => {
                pass.sync_requests.push(query);
                Ok(())
            }
            Command::Shutdown => {
                pass.shutdown_requested = true;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_entity_command(
        &self,
        txn: &Transaction<'_>,
        queue: QueueKind,
        entity_type: &str,
        id: Identifier,
        operation: Operation,
        properties: BTreeMap<String, pimdb_codec::Value>,
        pass: &mut PassResult,
        state: &mut CommandState,
    ) -> Result<()> {
        let revision = self
            .store
            .write_entity(txn, entity_type, id, operation, properties)?;
        let written = self
            .store
            .read_entity(txn, entity_type, Key::new(id, revision))?;

        let mut enriched = written.clone();
        let context = PreprocessorContext {
            store: &self.store,
            queue,
        };
        if let Some(chain) = self
            .preprocessors
            .get(&(entity_type.to_string(), operation.to_code()))
        {
            for (i, preprocessor) in chain.iter().enumerate() {
                *state = CommandState::Preprocessing(i);
                preprocessor
                    .process(&context, &mut enriched, txn)
                    .map_err(|error| {
                        Error::transient(format!(
                            "preprocessor {} failed: {error}",
                            preprocessor.id()
                        ))
                    })?;
            }
        }

        enriched.metadata.processed = true;
        // Versions originating at the source must not be echoed back.
        enriched.metadata.replayed_to_source = queue == QueueKind::Synchronizer;
        self.store.rewrite_version(txn, &written, &enriched)?;

        pass.wrote_entities = true;
        Ok(())
    }

    /// Drops the superseded version at `revision`.
    ///
    /// Call for each revision in ascending order once the replay
    /// low-water mark has passed it.
    pub fn cleanup_revision(&self, revision: Revision) -> Result<()> {
        let txn = self.env.begin(AccessMode::ReadWrite)?;
        self.store.cleanup_revision(&txn, revision)?;
        txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("user_queue", &self.user_queue.len())
            .field("sync_queue", &self.sync_queue.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{AdaptorRegistry, TypeAdaptor};
    use pimdb_codec::Value;
    use tempfile::tempdir;

    fn setup(dir: &Path) -> Pipeline {
        let env = Environment::open_in_memory("pipeline-test");
        let mut registry = AdaptorRegistry::new();
        registry.register(TypeAdaptor::new(
            "mail",
            &["uid", "subject", "sender", "folder", "threadId"],
            &["uid", "folder"],
            &["uid", "subject", "sender"],
        ));
        let store = EntityStore::new(Arc::new(registry));
        Pipeline::open(env, store, dir).unwrap()
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::Text((*v).to_string())))
            .collect()
    }

    fn create_command(uid: &str) -> Command {
        Command::Create {
            entity_type: "mail".into(),
            id: Identifier::generate(),
            properties: props(&[("uid", uid)]),
        }
    }

    #[test]
    fn empty_step_reports_drained() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        let outcome = pipeline.step().unwrap();
        assert!(outcome.drained);
        assert!(outcome.committed_revision.is_none());
    }

    #[test]
    fn create_command_commits_a_revision() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        pipeline
            .enqueue(QueueKind::User, &create_command("u1"))
            .unwrap();
        let outcome = pipeline.step().unwrap();
        assert_eq!(outcome.committed_revision, Some(Revision::new(1)));
        assert_eq!(
            outcome.command_states,
            vec![(QueueKind::User, CommandState::Committed)]
        );
        assert!(pipeline.is_drained());
    }

    #[test]
    fn user_queue_has_priority_and_both_queues_drain() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        let sync_id = Identifier::generate();
        pipeline
            .enqueue(
                QueueKind::Synchronizer,
                &Command::Create {
                    entity_type: "mail".into(),
                    id: sync_id,
                    properties: props(&[("uid", "from-sync")]),
                },
            )
            .unwrap();
        pipeline
            .enqueue(QueueKind::User, &create_command("from-user"))
            .unwrap();

        let outcome = pipeline.step().unwrap();
        // One command per queue, user first.
        assert_eq!(outcome.command_states.len(), 2);
        assert_eq!(outcome.command_states[0].0, QueueKind::User);
        assert_eq!(outcome.committed_revision, Some(Revision::new(2)));
    }

    #[test]
    fn sync_originated_versions_are_marked_replayed() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        let id = Identifier::generate();
        pipeline
            .enqueue(
                QueueKind::Synchronizer,
                &Command::Create {
                    entity_type: "mail".into(),
                    id,
                    properties: props(&[("uid", "remote")]),
                },
            )
            .unwrap();
        pipeline.step().unwrap();

        let txn = pipeline.env.begin(AccessMode::ReadOnly).unwrap();
        let entity = pipeline.store.read_latest(&txn, "mail", id).unwrap();
        assert!(entity.metadata.replayed_to_source);
        assert!(entity.metadata.processed);
    }

    #[test]
    fn failed_command_does_not_take_down_the_step() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        let id = Identifier::generate();
        // Modification of a missing entity fails.
        pipeline
            .enqueue(
                QueueKind::User,
                &Command::Modify {
                    entity_type: "mail".into(),
                    id,
                    properties: props(&[("subject", "x")]),
                },
            )
            .unwrap();
        pipeline
            .enqueue(
                QueueKind::Synchronizer,
                &Command::Create {
                    entity_type: "mail".into(),
                    id: Identifier::generate(),
                    properties: props(&[("uid", "ok")]),
                },
            )
            .unwrap();

        let outcome = pipeline.step().unwrap();
        assert!(matches!(
            outcome.command_states[0].1,
            CommandState::Failed(ErrorKind::NotFound)
        ));
        assert_eq!(outcome.command_states[1].1, CommandState::Committed);
        assert_eq!(outcome.committed_revision, Some(Revision::new(1)));
    }

    #[test]
    fn flush_token_reports_commit_revision() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        pipeline
            .enqueue(QueueKind::User, &create_command("u1"))
            .unwrap();
        pipeline.step().unwrap();

        pipeline
            .enqueue(
                QueueKind::User,
                &Command::Flush {
                    flush_id: "f1".into(),
                },
            )
            .unwrap();
        let outcome = pipeline.step().unwrap();
        assert_eq!(outcome.flushes, vec![("f1".to_string(), Revision::new(1))]);
        // A flush writes no entity.
        assert!(outcome.committed_revision.is_none());
    }

    #[test]
    fn preprocessors_run_in_declared_order_and_enrich() {
        struct Tag(&'static str);
        impl Preprocessor for Tag {
            fn id(&self) -> &str {
                self.0
            }
            fn process(
                &self,
                _context: &PreprocessorContext<'_>,
                entity: &mut Entity,
                _txn: &Transaction<'_>,
            ) -> Result<()> {
                let current = entity
                    .property("threadId")
                    .and_then(Value::as_text)
                    .unwrap_or("")
                    .to_string();
                entity
                    .properties
                    .insert("threadId".into(), Value::Text(format!("{current}{}", self.0)));
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        pipeline.set_preprocessors(
            "mail",
            Operation::Creation,
            vec![Box::new(Tag("a")), Box::new(Tag("b"))],
        );

        let id = Identifier::generate();
        pipeline
            .enqueue(
                QueueKind::User,
                &Command::Create {
                    entity_type: "mail".into(),
                    id,
                    properties: props(&[("uid", "u1")]),
                },
            )
            .unwrap();
        pipeline.step().unwrap();

        let txn = pipeline.env.begin(AccessMode::ReadOnly).unwrap();
        let entity = pipeline.store.read_latest(&txn, "mail", id).unwrap();
        assert_eq!(
            entity.property("threadId").and_then(Value::as_text),
            Some("ab")
        );
    }

    #[test]
    fn malformed_payload_is_a_protocol_failure() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        // Bypass the typed API to enqueue garbage.
        pipeline.user_queue.enqueue(1, &[0xde, 0xad]).unwrap();
        let outcome = pipeline.step().unwrap();
        assert!(matches!(
            outcome.command_states[0].1,
            CommandState::Failed(ErrorKind::Protocol)
        ));
        assert!(pipeline.is_drained());
    }

    #[test]
    fn control_commands_surface_in_outcome() {
        let dir = tempdir().unwrap();
        let mut pipeline = setup(dir.path());
        pipeline
            .enqueue(
                QueueKind::User,
                &Command::SynchronizeRequest {
                    query: Query::of_type("mail"),
                },
            )
            .unwrap();
        let outcome = pipeline.step().unwrap();
        assert_eq!(outcome.sync_requests.len(), 1);

        pipeline
            .enqueue(QueueKind::User, &Command::Shutdown)
            .unwrap();
        let outcome = pipeline.step().unwrap();
        assert!(outcome.shutdown_requested);

        pipeline
            .enqueue(
                QueueKind::User,
                &Command::RevisionReplayed {
                    revision: Revision::new(9),
                },
            )
            .unwrap();
        let outcome = pipeline.step().unwrap();
        assert_eq!(outcome.revision_replayed, Some(Revision::new(9)));
    }
}
