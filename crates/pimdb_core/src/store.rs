//! The revisioned entity store.
//!
//! Layout inside one environment:
//!
//! ```text
//! <type>.main              key = id‖revision, value = entity buffer
//! revisions                key = revision, value = (type, id)
//! uids                     key = id, value = latest revision
//! <type>.index.<property>  key = property value, value = id (dup)
//! ```
//!
//! All writes for one revision happen in one transaction, so the
//! invariants (`uids` points at the greatest stored revision, every
//! `revisions` row has its entity version) hold at every commit point.

use crate::adaptor::AdaptorRegistry;
use crate::entity::{Entity, Metadata, Operation};
use crate::error::{Error, Result};
use crate::index;
use crate::key::{Identifier, Key, Revision};
use pimdb_codec::Value;
use pimdb_storage::{ScanOptions, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Database of committed revisions in commit order.
const REVISIONS_DB: &str = "revisions";
/// Database mapping each id to its latest revision.
const UIDS_DB: &str = "uids";

/// Name of a type's main database.
#[must_use]
pub fn main_db_name(entity_type: &str) -> String {
    format!("{entity_type}.main")
}

fn encode_revision_target(entity_type: &str, id: Identifier) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + entity_type.len() + Identifier::INTERNAL_SIZE);
    out.push(entity_type.len() as u8);
    out.extend_from_slice(entity_type.as_bytes());
    out.extend_from_slice(id.as_bytes());
    out
}

fn decode_revision_target(bytes: &[u8]) -> Result<(String, Identifier)> {
    let type_len = *bytes
        .first()
        .ok_or_else(|| Error::corruption("empty revision row"))? as usize;
    let type_end = 1 + type_len;
    let entity_type = bytes
        .get(1..type_end)
        .and_then(|b| std::str::from_utf8(b).ok())
        .ok_or_else(|| Error::corruption("revision row type not UTF-8"))?
        .to_string();
    let id = Identifier::from_internal_bytes(
        bytes
            .get(type_end..)
            .ok_or_else(|| Error::corruption("revision row too short"))?,
    )?;
    Ok((entity_type, id))
}

/// Entity-level operations over an environment's databases.
///
/// The store is stateless: every call works on a caller-provided
/// transaction, so reads compose with snapshots and writes share the
/// pipeline's transaction.
#[derive(Clone)]
pub struct EntityStore {
    registry: Arc<AdaptorRegistry>,
}

impl EntityStore {
    /// Creates a store over the given adaptor registry.
    #[must_use]
    pub fn new(registry: Arc<AdaptorRegistry>) -> Self {
        Self { registry }
    }

    /// The adaptor registry.
    #[must_use]
    pub fn registry(&self) -> &AdaptorRegistry {
        &self.registry
    }

    /// Writes a new entity version, allocating the next revision.
    ///
    /// For modifications the given properties are merged over the
    /// previous version: present keys replace, `Null` deletes, absent
    /// keys are kept. Secondary indexes are maintained in the same
    /// transaction, diffed against the previous version.
    ///
    /// # Errors
    ///
    /// - Creation of an id that already exists is a protocol error
    /// - Modification or removal of a missing id is not-found
    /// - Any write after a removal is a corruption error (removal is
    ///   terminal)
    pub fn write_entity(
        &self,
        txn: &Transaction<'_>,
        entity_type: &str,
        id: Identifier,
        operation: Operation,
        properties: BTreeMap<String, Value>,
    ) -> Result<Revision> {
        let adaptor = self.registry.get(entity_type)?;
        let previous = self.read_latest_opt(txn, entity_type, id)?;

        if let Some(prev) = &previous {
            if prev.operation() == Operation::Removal {
                return Err(Error::corruption(format!(
                    "write to removed entity {id} of type {entity_type}"
                )));
            }
        }
        match operation {
            Operation::Creation => {
                if previous.is_some() {
                    return Err(Error::protocol(format!(
                        "creation of existing entity {id} of type {entity_type}"
                    )));
                }
            }
            Operation::Modification | Operation::Removal => {
                if previous.is_none() {
                    return Err(Error::not_found(format!(
                        "{operation:?} of unknown entity {id} of type {entity_type}"
                    )));
                }
            }
        }

        let revision = self.max_revision(txn)?.next();

        let final_properties = match (&previous, operation) {
            (Some(prev), Operation::Modification) => {
                let mut merged = prev.properties.clone();
                for (name, value) in properties {
                    if value.is_null() {
                        merged.remove(&name);
                    } else {
                        merged.insert(name, value);
                    }
                }
                merged
            }
            (_, Operation::Removal) => BTreeMap::new(),
            _ => properties,
        };

        let entity = Entity::new(
            entity_type,
            id,
            Metadata::new(revision, operation),
            final_properties,
        );

        let main = txn.open_database(&main_db_name(entity_type), false)?;
        main.put(
            &Key::new(id, revision).to_internal_bytes(),
            &entity.to_buffer()?,
        )?;

        let revisions = txn.open_database(REVISIONS_DB, false)?;
        revisions.put(
            &revision.to_internal_bytes(),
            &encode_revision_target(entity_type, id),
        )?;

        let uids = txn.open_database(UIDS_DB, false)?;
        uids.put(id.as_bytes(), &revision.to_internal_bytes())?;

        if let Some(prev) = &previous {
            index::remove_entries(txn, &adaptor, prev)?;
        }
        if operation != Operation::Removal {
            index::add_entries(txn, &adaptor, &entity)?;
        }

        Ok(revision)
    }

    /// Rewrites an entity version in place (same key, same revision).
    ///
    /// Used by the pipeline after the preprocessor chain enriched the
    /// version. Index entries are refreshed when the properties
    /// changed.
    pub fn rewrite_version(
        &self,
        txn: &Transaction<'_>,
        before: &Entity,
        after: &Entity,
    ) -> Result<()> {
        debug_assert_eq!(before.id, after.id);
        debug_assert_eq!(before.revision(), after.revision());
        let adaptor = self.registry.get(&after.entity_type)?;
        let main = txn.open_database(&main_db_name(&after.entity_type), false)?;
        main.put(
            &Key::new(after.id, after.revision()).to_internal_bytes(),
            &after.to_buffer()?,
        )?;
        if before.properties != after.properties && after.operation() != Operation::Removal {
            index::remove_entries(txn, &adaptor, before)?;
            index::add_entries(txn, &adaptor, after)?;
        }
        Ok(())
    }

    /// Reads the latest version of an entity.
    ///
    /// # Errors
    ///
    /// Not-found when the id has no stored version.
    pub fn read_latest(
        &self,
        txn: &Transaction<'_>,
        entity_type: &str,
        id: Identifier,
    ) -> Result<Entity> {
        self.read_latest_opt(txn, entity_type, id)?
            .ok_or_else(|| Error::not_found(format!("entity {id} of type {entity_type}")))
    }

    /// Reads the latest version of an entity, `None` when absent.
    pub fn read_latest_opt(
        &self,
        txn: &Transaction<'_>,
        entity_type: &str,
        id: Identifier,
    ) -> Result<Option<Entity>> {
        let main = txn.open_database(&main_db_name(entity_type), false)?;
        let mut found: Option<Vec<u8>> = None;
        match main.find_latest(id.as_bytes(), |_, value| {
            found = Some(value.to_vec());
        }) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        found.map(|raw| Entity::from_buffer(&raw)).transpose()
    }

    /// Reads one specific entity version.
    pub fn read_entity(&self, txn: &Transaction<'_>, entity_type: &str, key: Key) -> Result<Entity> {
        let main = txn.open_database(&main_db_name(entity_type), false)?;
        let raw = main.get(&key.to_internal_bytes())?.ok_or_else(|| {
            Error::not_found(format!("entity version {key} of type {entity_type}"))
        })?;
        Entity::from_buffer(&raw)
    }

    /// True if the id has a live (non-removed) latest version.
    pub fn exists(&self, txn: &Transaction<'_>, entity_type: &str, id: Identifier) -> Result<bool> {
        Ok(self
            .read_latest_opt(txn, entity_type, id)?
            .is_some_and(|e| e.operation() != Operation::Removal))
    }

    /// The greatest committed revision; zero on an empty store.
    pub fn max_revision(&self, txn: &Transaction<'_>) -> Result<Revision> {
        let revisions = txn.open_database(REVISIONS_DB, false)?;
        let mut latest = Revision::ZERO;
        match revisions.find_latest(b"", |key, _| {
            if let Ok(revision) = Revision::from_internal_bytes(key) {
                latest = revision;
            }
        }) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(latest)
    }

    /// The (type, id) committed at a revision.
    ///
    /// # Errors
    ///
    /// Not-found when the revision was cleaned up or never existed.
    pub fn revision_target(
        &self,
        txn: &Transaction<'_>,
        revision: Revision,
    ) -> Result<(String, Identifier)> {
        let revisions = txn.open_database(REVISIONS_DB, false)?;
        let raw = revisions
            .get(&revision.to_internal_bytes())?
            .ok_or_else(|| Error::not_found(format!("revision {revision}")))?;
        decode_revision_target(&raw)
    }

    /// The id committed at a revision.
    pub fn uid_from_revision(&self, txn: &Transaction<'_>, revision: Revision) -> Result<Identifier> {
        Ok(self.revision_target(txn, revision)?.1)
    }

    /// The type committed at a revision.
    pub fn type_from_revision(&self, txn: &Transaction<'_>, revision: Revision) -> Result<String> {
        Ok(self.revision_target(txn, revision)?.0)
    }

    /// The latest revision recorded for an id.
    pub fn latest_revision(&self, txn: &Transaction<'_>, id: Identifier) -> Result<Revision> {
        let uids = txn.open_database(UIDS_DB, false)?;
        let raw = uids
            .get(id.as_bytes())?
            .ok_or_else(|| Error::not_found(format!("uid {id}")))?;
        Revision::from_internal_bytes(&raw)
    }

    /// Iterates the latest version of every entity of a type, in id
    /// order. The handler returns `false` to stop.
    pub fn scan_type_latest(
        &self,
        txn: &Transaction<'_>,
        entity_type: &str,
        mut handler: impl FnMut(Entity) -> bool,
    ) -> Result<()> {
        let main = txn.open_database(&main_db_name(entity_type), false)?;
        // Versions of one id are contiguous and ascending, so the last
        // entry before the id changes is the latest version.
        let mut pending: Option<(Identifier, Vec<u8>)> = None;
        let mut stopped = false;
        main.scan(
            b"",
            |key, value| {
                let Ok(parsed) = Key::from_internal_bytes(key) else {
                    return true;
                };
                if let Some((prev_id, raw)) = pending.take() {
                    if prev_id != parsed.identifier() {
                        if let Ok(entity) = Entity::from_buffer(&raw) {
                            if !handler(entity) {
                                stopped = true;
                                return false;
                            }
                        }
                    }
                }
                pending = Some((parsed.identifier(), value.to_vec()));
                true
            },
            ScanOptions {
                find_substring_keys: true,
                skip_internal_keys: true,
            },
        )?;
        if !stopped {
            if let Some((_, raw)) = pending {
                let entity = Entity::from_buffer(&raw)?;
                handler(entity);
            }
        }
        Ok(())
    }

    /// Asks the secondary indexes for a query's base set.
    pub fn query_indexes(
        &self,
        txn: &Transaction<'_>,
        entity_type: &str,
        query: &crate::query::Query,
    ) -> Result<index::IndexLookup> {
        let adaptor = self.registry.get(entity_type)?;
        index::query_indexes(txn, &adaptor, query)
    }

    /// Drops the entity version at `revision` if it is superseded.
    ///
    /// The latest revision of an id is never removed. Must be called
    /// for revisions in ascending order, only below the replay
    /// low-water mark.
    pub fn cleanup_revision(&self, txn: &Transaction<'_>, revision: Revision) -> Result<()> {
        let (entity_type, id) = match self.revision_target(txn, revision) {
            Ok(target) => target,
            // Already cleaned.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let latest = self.latest_revision(txn, id)?;
        if latest <= revision {
            return Ok(());
        }

        let main = txn.open_database(&main_db_name(entity_type.as_str()), false)?;
        match main.del(&Key::new(id, revision).to_internal_bytes()) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        let revisions = txn.open_database(REVISIONS_DB, false)?;
        revisions.del(&revision.to_internal_bytes())?;
        tracing::trace!(%revision, %id, "cleaned up superseded entity version");
        Ok(())
    }
}
