//! Reconciliation: turning remote fetches into pipeline commands.

use crate::error::SyncResult;
use crate::syncstore::SyncStore;
use pimdb_codec::Value;
use pimdb_core::{Command, Comparator, Identifier, Notification, QueueKind, Resource};
use pimdb_storage::AccessMode;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Hands fetched remote entities to the local engine.
///
/// Created per sync request; commands land on the synchronizer queue
/// and are applied when the resource next drains it.
pub struct Reconciler<'a> {
    resource: &'a Rc<Resource>,
    sync_store: &'a SyncStore,
    /// Entities this request touched, for progress reporting.
    touched: Vec<Identifier>,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler for one sync request.
    #[must_use]
    pub fn new(resource: &'a Rc<Resource>, sync_store: &'a SyncStore) -> Self {
        Self {
            resource,
            sync_store,
            touched: Vec::new(),
        }
    }

    /// Creates or modifies the local counterpart of a remote entity.
    ///
    /// - a known remote id whose comparable properties are unchanged
    ///   produces no command (idempotent sync)
    /// - a known remote id with changed properties produces a
    ///   modification
    /// - an unknown remote id either adopts an existing local entity
    ///   matching `merge_criteria` or produces a creation
    pub fn create_or_modify(
        &mut self,
        entity_type: &str,
        remote_id: &str,
        properties: BTreeMap<String, Value>,
        merge_criteria: &BTreeMap<String, Comparator>,
    ) -> SyncResult<()> {
        if let Some(local) = self.sync_store.lookup_remote_id(entity_type, remote_id)? {
            return self.modify_if_changed(entity_type, local, remote_id, properties);
        }

        if !merge_criteria.is_empty() {
            if let Some(existing) = self.find_matching(entity_type, merge_criteria)? {
                self.sync_store
                    .record_remote_id(entity_type, existing, remote_id)?;
                return self.modify_if_changed(entity_type, existing, remote_id, properties);
            }
        }

        let local = self.sync_store.resolve_remote_id(entity_type, remote_id)?;
        self.resource.enqueue_command(
            QueueKind::Synchronizer,
            &Command::Create {
                entity_type: entity_type.to_string(),
                id: local,
                properties,
            },
        )?;
        self.touched.push(local);
        Ok(())
    }

    fn modify_if_changed(
        &mut self,
        entity_type: &str,
        local: Identifier,
        remote_id: &str,
        properties: BTreeMap<String, Value>,
    ) -> SyncResult<()> {
        let store = self.resource.store();
        let txn = self
            .resource
            .env()
            .begin(AccessMode::ReadOnly)
            .map_err(pimdb_core::Error::from)?;
        let current = store.read_latest_opt(&txn, entity_type, local)?;
        drop(txn);

        let Some(current) = current else {
            // Mapped but never materialized locally (e.g. the create
            // command is still queued, or local state was wiped).
            self.resource.enqueue_command(
                QueueKind::Synchronizer,
                &Command::Create {
                    entity_type: entity_type.to_string(),
                    id: local,
                    properties,
                },
            )?;
            self.touched.push(local);
            return Ok(());
        };

        if current.operation() == pimdb_core::Operation::Removal {
            // Locally removed and terminal: the remote copy wins under
            // a fresh local id.
            self.sync_store
                .remove_remote_id(entity_type, local, remote_id)?;
            let fresh = self.sync_store.resolve_remote_id(entity_type, remote_id)?;
            self.resource.enqueue_command(
                QueueKind::Synchronizer,
                &Command::Create {
                    entity_type: entity_type.to_string(),
                    id: fresh,
                    properties,
                },
            )?;
            self.touched.push(fresh);
            return Ok(());
        }

        let adaptor = store.registry().get(entity_type)?;
        let changed = adaptor
            .comparable_properties()
            .iter()
            .any(|property| properties.get(property.as_str()) != current.property(property));
        if changed {
            self.resource.enqueue_command(
                QueueKind::Synchronizer,
                &Command::Modify {
                    entity_type: entity_type.to_string(),
                    id: local,
                    properties,
                },
            )?;
            self.touched.push(local);
        }
        Ok(())
    }

    fn find_matching(
        &self,
        entity_type: &str,
        criteria: &BTreeMap<String, Comparator>,
    ) -> SyncResult<Option<Identifier>> {
        let store = self.resource.store();
        let txn = self
            .resource
            .env()
            .begin(AccessMode::ReadOnly)
            .map_err(pimdb_core::Error::from)?;
        let mut found = None;
        store.scan_type_latest(&txn, entity_type, |entity| {
            if entity.operation() == pimdb_core::Operation::Removal {
                return true;
            }
            let matches = criteria
                .iter()
                .all(|(property, comparator)| comparator.matches(entity.property(property)));
            if matches {
                found = Some(entity.id);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    /// Enqueues removal commands for local entities whose remote
    /// counterpart no longer exists.
    ///
    /// `entry_generator` enumerates locally known ids of the type (the
    /// default enumeration is the sync store's mapping); `exists` is
    /// asked synchronously per remote id.
    pub fn scan_for_removals(
        &mut self,
        entity_type: &str,
        entry_generator: impl FnOnce(&mut dyn FnMut(Identifier)),
        exists: impl Fn(&str) -> bool,
    ) -> SyncResult<()> {
        let mut locals = Vec::new();
        entry_generator(&mut |id| locals.push(id));

        for local in locals {
            let Some(remote) = self.sync_store.resolve_local_id(entity_type, local)? else {
                continue;
            };
            if exists(&remote) {
                continue;
            }
            self.resource.enqueue_command(
                QueueKind::Synchronizer,
                &Command::Delete {
                    entity_type: entity_type.to_string(),
                    id: local,
                },
            )?;
            self.sync_store
                .remove_remote_id(entity_type, local, &remote)?;
            self.touched.push(local);
        }
        Ok(())
    }

    /// [`Reconciler::scan_for_removals`] over every mapped id.
    pub fn scan_for_removals_all(
        &mut self,
        entity_type: &str,
        exists: impl Fn(&str) -> bool,
    ) -> SyncResult<()> {
        let mut locals = Vec::new();
        self.sync_store
            .for_each_mapping(entity_type, |local, _| locals.push(local))?;
        self.scan_for_removals(entity_type, move |emit| locals.iter().for_each(|id| emit(*id)), exists)
    }

    /// Reports request progress to notification subscribers.
    pub fn report_progress(&self, done: usize, total: usize) {
        self.resource.notifier().emit(&Notification::Progress {
            done,
            total,
            entities: self.touched.clone(),
        });
    }

    /// Ids this request has touched so far.
    #[must_use]
    pub fn touched(&self) -> &[Identifier] {
        &self.touched
    }
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("touched", &self.touched.len())
            .finish_non_exhaustive()
    }
}
