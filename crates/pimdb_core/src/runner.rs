//! Query execution: initial snapshot plus incremental live updates.
//!
//! The initial phase picks the best index set, prepares the candidate
//! id list, then loads entities in bounded batches so no single event
//! loop slice grows with the store. The live phase walks `revisions`
//! from the provider's baseline, so a subscriber never misses or
//! duplicates a revision.

use crate::entity::{Entity, Operation};
use crate::error::Result;
use crate::key::{Identifier, Key, Revision};
use crate::notifier::{Notification, Notifier};
use crate::provider::ResultProvider;
use crate::query::Query;
use crate::store::{main_db_name, EntityStore};
use pimdb_codec::Value;
use pimdb_storage::{AccessMode, Environment, ScanOptions, Transaction};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Prepared state of the initial phase.
struct InitialPlan {
    /// (type, id) candidates still to load.
    queue: VecDeque<(String, Identifier)>,
    /// Filter keys satisfied by the index lookup, per type.
    applied: HashMap<String, HashSet<String>>,
    /// Baseline for the live phase: max revision at prepare time.
    baseline: Revision,
}

/// Runs one query against one resource instance and keeps the
/// provider updated while subscribed.
///
/// The provider owns the runner; dropping the runner unsubscribes from
/// the resource's notification channel, which cancels the live query
/// at the next yield point.
pub struct QueryRunner {
    env: Arc<Environment>,
    store: EntityStore,
    query: Query,
    notifications: Option<Receiver<Notification>>,
    plan: Option<InitialPlan>,
    /// Highest revision this runner has walked; revision counters are
    /// per resource, so the runner tracks its own resource's progress
    /// even when several runners share one provider.
    last_seen: Revision,
    /// Entities loaded per initial step.
    initial_batch: usize,
    /// Revisions the resource may garbage-collect, reported after each
    /// incremental drain.
    replayed_up_to: Option<Revision>,
}

impl QueryRunner {
    /// Creates a runner. Live queries subscribe to the notifier.
    #[must_use]
    pub fn new(
        env: Arc<Environment>,
        store: EntityStore,
        query: Query,
        notifier: &Notifier,
    ) -> Self {
        let notifications = query.live.then(|| notifier.subscribe());
        Self {
            env,
            store,
            query,
            notifications,
            plan: None,
            last_seen: Revision::ZERO,
            initial_batch: 100,
            replayed_up_to: None,
        }
    }

    /// The query being run.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Overrides the initial-phase batch size.
    #[must_use]
    pub fn with_initial_batch(mut self, batch: usize) -> Self {
        self.initial_batch = batch.max(1);
        self
    }

    fn prepare_initial(&mut self) -> Result<InitialPlan> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        let baseline = self.store.max_revision(&txn)?;
        let mut queue = VecDeque::new();
        let mut applied = HashMap::new();

        for entity_type in self.query.types.clone() {
            if !self.query.ids.is_empty() {
                for id in &self.query.ids {
                    queue.push_back((entity_type.clone(), *id));
                }
                continue;
            }

            let lookup = self.store.query_indexes(&txn, &entity_type, &self.query)?;
            applied.insert(
                entity_type.clone(),
                lookup.applied.iter().cloned().collect::<HashSet<_>>(),
            );
            if let Some(ids) = lookup.ids {
                for id in ids {
                    queue.push_back((entity_type.clone(), id));
                }
            } else {
                // Full prefix scan over keys only; entities load later
                // in batches.
                for id in latest_ids(&txn, &entity_type)? {
                    queue.push_back((entity_type.clone(), id));
                }
            }
        }

        Ok(InitialPlan {
            queue,
            applied,
            baseline,
        })
    }

    /// Loads one batch of the initial phase.
    ///
    /// Returns true when the initial result is complete: the baseline
    /// revision is recorded and `children_fetched` becomes true, even
    /// for an empty result.
    pub fn step_initial(&mut self, provider: &mut dyn ResultProvider) -> Result<bool> {
        if self.plan.is_none() {
            self.plan = Some(self.prepare_initial()?);
        }

        let txn = self.env.begin(AccessMode::ReadOnly)?;
        // Work around borrowing self both for the plan and the filter
        // helpers: take the plan out for the duration of the batch.
        let mut plan = self.plan.take().unwrap_or(InitialPlan {
            queue: VecDeque::new(),
            applied: HashMap::new(),
            baseline: Revision::ZERO,
        });

        let mut loaded = 0usize;
        while loaded < self.initial_batch {
            let Some((entity_type, id)) = plan.queue.pop_front() else {
                break;
            };
            if let Some(entity) = self.store.read_latest_opt(&txn, &entity_type, id)? {
                let applied = plan.applied.get(&entity_type);
                self.emit_initial(entity, applied, None, provider);
            }
            loaded += 1;
        }

        if plan.queue.is_empty() {
            self.last_seen = self.last_seen.max(plan.baseline);
            provider.set_revision(plan.baseline);
            provider.set_children_fetched(true);
            self.plan = Some(plan);
            Ok(true)
        } else {
            self.plan = Some(plan);
            Ok(false)
        }
    }

    /// Runs the initial phase to completion.
    pub fn run_initial(&mut self, provider: &mut dyn ResultProvider) -> Result<()> {
        while !self.step_initial(provider)? {}
        Ok(())
    }

    /// Loads the children of `parent` for a tree query.
    pub fn fetch_children(
        &self,
        parent: Identifier,
        provider: &mut dyn ResultProvider,
    ) -> Result<()> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        for entity_type in self.query.types.clone() {
            for id in latest_ids(&txn, &entity_type)? {
                if let Some(entity) = self.store.read_latest_opt(&txn, &entity_type, id)? {
                    self.emit_initial(entity, None, Some(parent), provider);
                }
            }
        }
        Ok(())
    }

    fn emit_initial(
        &self,
        entity: Entity,
        applied: Option<&HashSet<String>>,
        parent: Option<Identifier>,
        provider: &mut dyn ResultProvider,
    ) {
        if entity.operation() == Operation::Removal {
            return;
        }
        if !self.query.ids.is_empty() && !self.query.ids.contains(&entity.id) {
            return;
        }
        if !self.tree_scope_matches(&entity, parent) {
            return;
        }
        if !self.residual_matches(&entity, applied) {
            return;
        }
        provider.add(entity);
    }

    /// True when the entity sits at the requested tree position.
    ///
    /// Without a parent property every entity is in scope. With one,
    /// the base query returns roots (parent unset) and subtree loads
    /// return the children of the given parent.
    fn tree_scope_matches(&self, entity: &Entity, parent: Option<Identifier>) -> bool {
        let Some(parent_property) = &self.query.parent_property else {
            return true;
        };
        // An explicit filter on the parent property overrides tree
        // scoping; the caller asked for an exact slice.
        if self.query.property_filter.contains_key(parent_property) {
            return true;
        }
        let actual = entity
            .property(parent_property)
            .and_then(Value::as_bytes)
            .and_then(|raw| Identifier::from_internal_bytes(raw).ok());
        actual == parent
    }

    /// Applies the residual filter: every comparator the index lookup
    /// did not satisfy. Removals always pass (they may not carry the
    /// property values any more).
    fn residual_matches(&self, entity: &Entity, applied: Option<&HashSet<String>>) -> bool {
        if entity.operation() == Operation::Removal {
            return true;
        }
        for (property, comparator) in &self.query.property_filter {
            if applied.is_some_and(|set| set.contains(property)) {
                continue;
            }
            let value = entity.property(property);
            if value.is_none() {
                tracing::warn!(
                    property,
                    entity = %entity.id,
                    "filter on absent property, treating as non-matching"
                );
            }
            if !comparator.matches(value) {
                return false;
            }
        }
        true
    }

    /// Drains pending notifications; on a revision update, replays new
    /// revisions into the provider. Returns the number of emitted
    /// provider events.
    pub fn process_notifications(&mut self, provider: &mut dyn ResultProvider) -> Result<usize> {
        let Some(receiver) = &self.notifications else {
            return Ok(0);
        };
        let mut saw_update = false;
        while let Ok(notification) = receiver.try_recv() {
            if matches!(notification, Notification::RevisionUpdated(_)) {
                saw_update = true;
            }
        }
        if saw_update {
            self.incremental_update(provider)
        } else {
            Ok(0)
        }
    }

    /// Replays `revisions[provider.revision()+1 ..= max]` into the
    /// provider, applying the same residual filter. A modification
    /// that stops matching is emitted as a removal (tombstone).
    pub fn incremental_update(&mut self, provider: &mut dyn ResultProvider) -> Result<usize> {
        let txn = self.env.begin(AccessMode::ReadOnly)?;
        let max = self.store.max_revision(&txn)?;
        let mut revision = self.last_seen.max(provider.revision());
        let mut emitted = 0usize;

        while revision < max {
            let next = revision.next();
            revision = next;

            let (entity_type, id) = match self.store.revision_target(&txn, next) {
                Ok(target) => target,
                Err(error) if error.is_not_found() => continue,
                Err(error) => return Err(error),
            };
            if !self.query.matches_type(&entity_type) {
                continue;
            }
            if !self.query.ids.is_empty() && !self.query.ids.contains(&id) {
                continue;
            }
            let entity = self
                .store
                .read_entity(&txn, &entity_type, Key::new(id, next))?;

            match entity.operation() {
                Operation::Removal => {
                    provider.remove(entity);
                    emitted += 1;
                }
                Operation::Creation => {
                    if self.tree_scope_matches(&entity, None)
                        && self.residual_matches(&entity, None)
                    {
                        provider.add(entity);
                        emitted += 1;
                    }
                }
                Operation::Modification => {
                    if self.tree_scope_matches(&entity, None)
                        && self.residual_matches(&entity, None)
                    {
                        provider.modify(entity);
                    } else {
                        // Fell out of the filter: tombstone.
                        provider.remove(entity);
                    }
                    emitted += 1;
                }
            }
        }

        self.last_seen = max;
        provider.set_revision(max);
        self.replayed_up_to = Some(max);
        Ok(emitted)
    }

    /// Takes the revision the resource may garbage-collect up to, as
    /// declared by the last incremental drain.
    pub fn take_replayed_up_to(&mut self) -> Option<Revision> {
        self.replayed_up_to.take()
    }
}

/// Collects the id of the latest version of every entity of a type,
/// decoding keys only.
fn latest_ids(txn: &Transaction<'_>, entity_type: &str) -> Result<Vec<Identifier>> {
    let main = txn.open_database(&main_db_name(entity_type), false)?;
    let mut ids: Vec<Identifier> = Vec::new();
    main.scan(
        b"",
        |key, _| {
            if let Ok(parsed) = Key::from_internal_bytes(key) {
                if ids.last() != Some(&parsed.identifier()) {
                    ids.push(parsed.identifier());
                }
            }
            true
        },
        ScanOptions {
            find_substring_keys: true,
            skip_internal_keys: true,
        },
    )?;
    Ok(ids)
}

impl std::fmt::Debug for QueryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRunner")
            .field("types", &self.query.types)
            .field("live", &self.query.live)
            .finish_non_exhaustive()
    }
}
