//! Secondary index maintenance and index-driven lookups.
//!
//! Every indexed property of a type gets its own duplicate-key
//! database `<type>.index.<property>`: key = canonical encoding of the
//! property value, value = entity identifier. Index updates happen in
//! the same transaction as the entity write.

use crate::adaptor::TypeAdaptor;
use crate::entity::Entity;
use crate::error::Result;
use crate::key::Identifier;
use crate::query::{Comparator, Query};
use pimdb_codec::{encode, Value};
use pimdb_storage::{ScanOptions, Transaction};

/// Name of the index database for a type's property.
#[must_use]
pub fn index_db_name(entity_type: &str, property: &str) -> String {
    format!("{entity_type}.index.{property}")
}

/// Canonical index key for a property value.
fn index_key(value: &Value) -> Result<Vec<u8>> {
    Ok(encode(value)?)
}

/// Result of asking the indexes for a query's base set.
#[derive(Debug, Clone)]
pub struct IndexLookup {
    /// Identifiers satisfying the applied filters, `None` when no
    /// index could be applied (caller falls back to a full scan).
    pub ids: Option<Vec<Identifier>>,
    /// Filter keys the index lookup already satisfied; the residual
    /// filter covers the rest.
    pub applied: Vec<String>,
}

/// Inserts index entries for a freshly written entity version.
pub fn add_entries(txn: &Transaction<'_>, adaptor: &TypeAdaptor, entity: &Entity) -> Result<()> {
    for property in adaptor.indexed_properties() {
        if let Some(value) = entity.property(property) {
            let db = txn.open_database(&index_db_name(adaptor.type_name(), property), true)?;
            db.put(&index_key(value)?, entity.id.as_bytes())?;
        }
    }
    Ok(())
}

/// Removes the index entries of a superseded entity version.
///
/// Missing entries are tolerated; an older version may predate the
/// property being indexed.
pub fn remove_entries(txn: &Transaction<'_>, adaptor: &TypeAdaptor, entity: &Entity) -> Result<()> {
    for property in adaptor.indexed_properties() {
        if let Some(value) = entity.property(property) {
            let db = txn.open_database(&index_db_name(adaptor.type_name(), property), true)?;
            match db.del_entry(&index_key(value)?, entity.id.as_bytes()) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

/// Looks up identifiers for one property equality.
pub fn lookup(
    txn: &Transaction<'_>,
    entity_type: &str,
    property: &str,
    value: &Value,
) -> Result<Vec<Identifier>> {
    let db = txn.open_database(&index_db_name(entity_type, property), true)?;
    let mut ids = Vec::new();
    db.scan(
        &index_key(value)?,
        |_, id_bytes| {
            if let Ok(id) = Identifier::from_internal_bytes(id_bytes) {
                ids.push(id);
            }
            true
        },
        ScanOptions::default(),
    )?;
    Ok(ids)
}

/// Selects the best index set for a query's property filter.
///
/// Every equality filter on an indexed property is applied; the
/// resulting id sets are intersected. Filters on unindexed properties
/// stay in the residual.
pub fn query_indexes(
    txn: &Transaction<'_>,
    adaptor: &TypeAdaptor,
    query: &Query,
) -> Result<IndexLookup> {
    let mut ids: Option<Vec<Identifier>> = None;
    let mut applied = Vec::new();

    for (property, comparator) in &query.property_filter {
        if !adaptor.is_indexed(property) {
            continue;
        }
        let Comparator::Equals(value) = comparator;
        let matches = lookup(txn, adaptor.type_name(), property, value)?;
        applied.push(property.clone());
        ids = Some(match ids {
            None => matches,
            Some(current) => current
                .into_iter()
                .filter(|id| matches.contains(id))
                .collect(),
        });
        if matches!(&ids, Some(set) if set.is_empty()) {
            break;
        }
    }

    Ok(IndexLookup { ids, applied })
}
