//! An in-memory remote source for tests.

use pimdb_codec::Value;
use pimdb_core::{Entity, Operation, Query};
use pimdb_sync::{Reconciler, RemoteSource, SyncError, SyncResult};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// The "server side" of a [`DummySource`], shared with the test so it
/// can mutate remote state between syncs.
#[derive(Debug, Default)]
pub struct SharedRemoteState {
    /// type → remote id → properties.
    pub entities: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
    /// Next remote id suffix for write-back creations.
    pub next_remote_id: u64,
    /// When set, every request fails with this code (credentials,
    /// connectivity, ...).
    pub failure: Option<(i32, String)>,
}

impl SharedRemoteState {
    /// Inserts a remote entity.
    pub fn insert(
        &mut self,
        entity_type: &str,
        remote_id: &str,
        properties: BTreeMap<String, Value>,
    ) {
        self.entities
            .entry(entity_type.to_string())
            .or_default()
            .insert(remote_id.to_string(), properties);
    }

    /// Removes a remote entity; true if it existed.
    pub fn remove(&mut self, entity_type: &str, remote_id: &str) -> bool {
        self.entities
            .get_mut(entity_type)
            .is_some_and(|entities| entities.remove(remote_id).is_some())
    }

    /// Number of remote entities of a type.
    #[must_use]
    pub fn count(&self, entity_type: &str) -> usize {
        self.entities
            .get(entity_type)
            .map_or(0, BTreeMap::len)
    }

    /// Makes every request fail until [`SharedRemoteState::recover`].
    pub fn fail_with(&mut self, code: i32, message: impl Into<String>) {
        self.failure = Some((code, message.into()));
    }

    /// Clears the failure mode.
    pub fn recover(&mut self) {
        self.failure = None;
    }
}

/// An in-memory protocol adapter.
///
/// Pulls hand every remote entity of the queried types to the
/// reconciler and scan for removals afterwards; pushes store local
/// changes into the shared remote state, assigning `remote-N` ids.
pub struct DummySource {
    state: Rc<RefCell<SharedRemoteState>>,
}

impl DummySource {
    /// Creates a source and returns it with its shared state handle.
    #[must_use]
    pub fn new() -> (DummySource, Rc<RefCell<SharedRemoteState>>) {
        let state = Rc::new(RefCell::new(SharedRemoteState::default()));
        (
            DummySource {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl RemoteSource for DummySource {
    fn name(&self) -> &str {
        "dummy"
    }

    fn synchronize_with_source(
        &mut self,
        query: &Query,
        reconciler: &mut Reconciler<'_>,
    ) -> SyncResult<()> {
        if let Some((code, message)) = self.state.borrow().failure.clone() {
            return Err(SyncError::remote(code, message));
        }

        let types: Vec<String> = if query.types.is_empty() {
            self.state.borrow().entities.keys().cloned().collect()
        } else {
            query.types.clone()
        };

        for entity_type in types {
            let entities: Vec<(String, BTreeMap<String, Value>)> = self
                .state
                .borrow()
                .entities
                .get(&entity_type)
                .map(|remote| {
                    remote
                        .iter()
                        .map(|(id, props)| (id.clone(), props.clone()))
                        .collect()
                })
                .unwrap_or_default();

            let total = entities.len();
            for (done, (remote_id, properties)) in entities.into_iter().enumerate() {
                reconciler.create_or_modify(
                    &entity_type,
                    &remote_id,
                    properties,
                    &BTreeMap::new(),
                )?;
                reconciler.report_progress(done + 1, total);
            }

            let state = Rc::clone(&self.state);
            let surviving_type = entity_type.clone();
            reconciler.scan_for_removals_all(&entity_type, move |remote_id| {
                state
                    .borrow()
                    .entities
                    .get(&surviving_type)
                    .is_some_and(|remote| remote.contains_key(remote_id))
            })?;
        }
        Ok(())
    }

    fn replay_change(
        &mut self,
        entity_type: &str,
        entity: &Entity,
        operation: Operation,
        old_remote_id: Option<&str>,
    ) -> SyncResult<Option<String>> {
        if let Some((code, message)) = self.state.borrow().failure.clone() {
            return Err(SyncError::remote(code, message));
        }

        let mut state = self.state.borrow_mut();
        match operation {
            Operation::Removal => {
                if let Some(remote_id) = old_remote_id {
                    state.remove(entity_type, remote_id);
                }
                Ok(None)
            }
            Operation::Creation | Operation::Modification => {
                let remote_id = match old_remote_id {
                    Some(existing) => existing.to_string(),
                    None => {
                        state.next_remote_id += 1;
                        format!("remote-{}", state.next_remote_id)
                    }
                };
                state.insert(entity_type, &remote_id, entity.properties.clone());
                Ok(Some(remote_id))
            }
        }
    }
}
