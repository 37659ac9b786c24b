//! Persistent remote-id ↔ local-id mapping.
//!
//! Per type, two databases:
//!
//! ```text
//! remoteid.mapping.<type>   key = remote id, value = local id
//! localid.mapping.<type>    key = local id, value = remote id (dup)
//! ```
//!
//! A remote id maps to at most one local id; a local id may map to
//! several remote ids while a write-back race settles.

use crate::error::SyncResult;
use pimdb_core::Identifier;
use pimdb_storage::{AccessMode, Environment, ScanOptions};
use std::sync::Arc;

fn remote_db_name(entity_type: &str) -> String {
    format!("remoteid.mapping.{entity_type}")
}

fn local_db_name(entity_type: &str) -> String {
    format!("localid.mapping.{entity_type}")
}

/// The synchronizer's private storage.
#[derive(Clone)]
pub struct SyncStore {
    env: Arc<Environment>,
}

impl SyncStore {
    /// Creates a sync store over the resource's environment.
    #[must_use]
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    /// Records a remote-id ↔ local-id pair.
    pub fn record_remote_id(
        &self,
        entity_type: &str,
        local: Identifier,
        remote: &str,
    ) -> SyncResult<()> {
        let txn = self.env.begin(AccessMode::ReadWrite).map_err(pimdb_core::Error::from)?;
        txn.open_database(&remote_db_name(entity_type), false)
            .and_then(|db| db.put(remote.as_bytes(), local.as_bytes()))
            .map_err(pimdb_core::Error::from)?;
        txn.open_database(&local_db_name(entity_type), true)
            .and_then(|db| db.put(local.as_bytes(), remote.as_bytes()))
            .map_err(pimdb_core::Error::from)?;
        txn.commit().map_err(pimdb_core::Error::from)?;
        Ok(())
    }

    /// Removes a remote-id ↔ local-id pair.
    ///
    /// Missing entries are tolerated; removal may race write-back.
    pub fn remove_remote_id(
        &self,
        entity_type: &str,
        local: Identifier,
        remote: &str,
    ) -> SyncResult<()> {
        let txn = self.env.begin(AccessMode::ReadWrite).map_err(pimdb_core::Error::from)?;
        let remote_db = txn
            .open_database(&remote_db_name(entity_type), false)
            .map_err(pimdb_core::Error::from)?;
        if let Err(err) = remote_db.del(remote.as_bytes()) {
            if !err.is_not_found() {
                return Err(pimdb_core::Error::from(err).into());
            }
        }
        let local_db = txn
            .open_database(&local_db_name(entity_type), true)
            .map_err(pimdb_core::Error::from)?;
        if let Err(err) = local_db.del_entry(local.as_bytes(), remote.as_bytes()) {
            if !err.is_not_found() {
                return Err(pimdb_core::Error::from(err).into());
            }
        }
        txn.commit().map_err(pimdb_core::Error::from)?;
        Ok(())
    }

    /// The local id a remote id maps to, if any.
    pub fn lookup_remote_id(
        &self,
        entity_type: &str,
        remote: &str,
    ) -> SyncResult<Option<Identifier>> {
        let txn = self.env.begin(AccessMode::ReadOnly).map_err(pimdb_core::Error::from)?;
        let db = txn
            .open_database(&remote_db_name(entity_type), false)
            .map_err(pimdb_core::Error::from)?;
        let raw = db.get(remote.as_bytes()).map_err(pimdb_core::Error::from)?;
        Ok(match raw {
            Some(bytes) => Some(Identifier::from_internal_bytes(&bytes)?),
            None => None,
        })
    }

    /// The local id for a remote id, creating (and recording) a fresh
    /// one when the remote id is new.
    pub fn resolve_remote_id(&self, entity_type: &str, remote: &str) -> SyncResult<Identifier> {
        if let Some(existing) = self.lookup_remote_id(entity_type, remote)? {
            return Ok(existing);
        }
        let local = Identifier::generate();
        self.record_remote_id(entity_type, local, remote)?;
        Ok(local)
    }

    /// The (first) remote id a local id maps to, if any.
    pub fn resolve_local_id(
        &self,
        entity_type: &str,
        local: Identifier,
    ) -> SyncResult<Option<String>> {
        let txn = self.env.begin(AccessMode::ReadOnly).map_err(pimdb_core::Error::from)?;
        let db = txn
            .open_database(&local_db_name(entity_type), true)
            .map_err(pimdb_core::Error::from)?;
        let raw = db.get(local.as_bytes()).map_err(pimdb_core::Error::from)?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Enumerates every locally known id of a type with its remote id.
    pub fn for_each_mapping(
        &self,
        entity_type: &str,
        mut handler: impl FnMut(Identifier, &str),
    ) -> SyncResult<()> {
        let txn = self.env.begin(AccessMode::ReadOnly).map_err(pimdb_core::Error::from)?;
        let db = txn
            .open_database(&local_db_name(entity_type), true)
            .map_err(pimdb_core::Error::from)?;
        db.scan(
            b"",
            |key, value| {
                if let Ok(local) = Identifier::from_internal_bytes(key) {
                    handler(local, &String::from_utf8_lossy(value));
                }
                true
            },
            ScanOptions {
                find_substring_keys: true,
                skip_internal_keys: true,
            },
        )
        .map_err(pimdb_core::Error::from)?;
        Ok(())
    }
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore").finish_non_exhaustive()
    }
}
