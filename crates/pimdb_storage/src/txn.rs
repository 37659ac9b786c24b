//! Transactions and named database handles.

use crate::env::{AccessMode, Environment};
use crate::error::{ErrorCode, ErrorHandler, StorageError, StorageResult};
use crate::log::LogRecord;
use crate::{is_internal_key, INTERNAL_KEY_PREFIX};
use parking_lot::MutexGuard;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Key under which a database records its own logical name.
const DB_NAME_MARKER: &[u8] = b"__internal_dbname";

/// One named sub-database: an ordered multimap of byte strings.
///
/// Values under a key are kept sorted; databases without duplicates
/// keep exactly one value per key.
#[derive(Clone)]
pub(crate) struct Table {
    pub(crate) allow_duplicates: bool,
    pub(crate) map: Arc<BTreeMap<Vec<u8>, Vec<Vec<u8>>>>,
}

impl Table {
    pub(crate) fn new(allow_duplicates: bool) -> Self {
        Self {
            allow_duplicates,
            map: Arc::new(BTreeMap::new()),
        }
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let map = Arc::make_mut(&mut self.map);
        let slot = map.entry(key).or_default();
        if self.allow_duplicates {
            if let Err(pos) = slot.binary_search(&value) {
                slot.insert(pos, value);
            }
        } else {
            slot.clear();
            slot.push(value);
        }
    }

    /// Removes a key, or one duplicate entry under it. Returns whether
    /// anything was removed.
    pub(crate) fn del(&mut self, key: &[u8], value: Option<&[u8]>) -> bool {
        let map = Arc::make_mut(&mut self.map);
        match value {
            None => map.remove(key).is_some(),
            Some(v) => {
                let Some(slot) = map.get_mut(key) else {
                    return false;
                };
                let Ok(pos) = slot.binary_search(&v.to_vec()) else {
                    return false;
                };
                slot.remove(pos);
                if slot.is_empty() {
                    map.remove(key);
                }
                true
            }
        }
    }
}

/// Committed environment state: all named databases.
pub(crate) type State = HashMap<String, Table>;

/// Options controlling [`NamedDatabase::scan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Position by range instead of key equality, returning every key
    /// that starts with the given prefix.
    pub find_substring_keys: bool,
    /// Skip keys reserved for internal bookkeeping.
    pub skip_internal_keys: bool,
}

struct TxnInner<'env> {
    state: State,
    redo: Vec<LogRecord>,
    wrote: bool,
    error_flagged: bool,
    finished: bool,
    _guard: Option<MutexGuard<'env, ()>>,
}

/// A scoped transaction over an environment.
///
/// Read transactions hold a stable snapshot taken at begin time. Write
/// transactions hold the environment's single-writer lock; their
/// changes become visible (and durable) at commit.
///
/// Dropping a write transaction commits implicitly when at least one
/// write happened and no error was flagged, and aborts otherwise.
pub struct Transaction<'env> {
    env: &'env Environment,
    mode: AccessMode,
    inner: RefCell<TxnInner<'env>>,
    error_handler: RefCell<Option<ErrorHandler>>,
}

impl<'env> Transaction<'env> {
    pub(crate) fn new(env: &'env Environment, mode: AccessMode) -> Self {
        let guard = match mode {
            AccessMode::ReadWrite => Some(env.write_lock.lock()),
            AccessMode::ReadOnly => None,
        };
        // The snapshot is a table of Arcs; cloning it is cheap and the
        // maps themselves stay shared until a writer touches them.
        let state = env.state.read().clone();
        Self {
            env,
            mode,
            inner: RefCell::new(TxnInner {
                state,
                redo: Vec::new(),
                wrote: false,
                error_flagged: false,
                finished: false,
                _guard: guard,
            }),
            error_handler: RefCell::new(None),
        }
    }

    /// The transaction's access mode.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Installs an error handler that shadows the environment default
    /// for errors surfaced by this transaction's databases.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.borrow_mut() = Some(handler);
    }

    /// Flags the transaction as failed; a flagged transaction never
    /// commits implicitly on drop.
    pub fn flag_error(&self) {
        self.inner.borrow_mut().error_flagged = true;
    }

    /// Opens a named database inside this transaction.
    ///
    /// In read-write mode a missing database is created; in read-only
    /// mode the returned handle reads as empty. A stored database-name
    /// marker that disagrees with `name` is a misconfiguration error
    /// (the caller mounted the wrong database).
    pub fn open_database(
        &self,
        name: &str,
        allow_duplicates: bool,
    ) -> StorageResult<NamedDatabase<'_, 'env>> {
        let mut present = true;
        {
            let mut inner = self.inner.borrow_mut();
            match inner.state.get(name) {
                Some(table) => {
                    if table.allow_duplicates != allow_duplicates {
                        return Err(self.report(StorageError::misconfiguration(
                            self.store_name(name),
                            "database duplicate-key flag mismatch",
                        )));
                    }
                }
                None => {
                    if self.mode == AccessMode::ReadWrite {
                        inner.state.insert(name.to_string(), Table::new(allow_duplicates));
                        inner.redo.push(LogRecord::OpenDb {
                            name: name.to_string(),
                            allow_duplicates,
                        });
                        inner.wrote = true;
                    } else {
                        present = false;
                    }
                }
            }
        }

        let db = NamedDatabase {
            txn: self,
            name: name.to_string(),
            allow_duplicates,
            present,
        };
        if present {
            db.ensure_correct_database()?;
        }
        Ok(db)
    }

    /// Names of databases visible to this transaction, sorted.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut names: Vec<String> = inner.state.keys().cloned().collect();
        names.sort();
        names
    }

    /// Commits the transaction.
    ///
    /// For read transactions this is a no-op release. For write
    /// transactions the redo records are made durable before the new
    /// state becomes visible.
    pub fn commit(self) -> StorageResult<()> {
        let result = self.commit_inner();
        // Drop must not repeat the attempt.
        self.inner.borrow_mut().finished = true;
        result
    }

    /// Aborts the transaction, discarding all changes.
    pub fn abort(self) {
        self.inner.borrow_mut().finished = true;
    }

    fn commit_inner(&self) -> StorageResult<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.finished {
            return Ok(());
        }
        if self.mode == AccessMode::ReadOnly || !inner.wrote {
            return Ok(());
        }

        if let Some(log) = &self.env.log {
            let mut writer = log.lock();
            for record in &inner.redo {
                writer.append(record, self.env.name())?;
            }
            writer.append(&LogRecord::Commit, self.env.name())?;
            writer.sync(self.env.name())?;
        }

        *self.env.state.write() = std::mem::take(&mut inner.state);
        Ok(())
    }

    fn store_name(&self, db: &str) -> String {
        format!("{}/{}", self.env.name(), db)
    }

    /// Routes an error through the nearest configured handler, then
    /// returns it for propagation. Not-found conditions are too common
    /// to report.
    fn report(&self, error: StorageError) -> StorageError {
        if error.code != ErrorCode::NotFound {
            match self.error_handler.borrow().as_ref() {
                Some(handler) => (handler.as_ref())(&error),
                None => (self.env.default_error_handler.read().as_ref())(&error),
            }
        }
        error
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let (finished, wrote, error_flagged) = {
            let inner = self.inner.borrow();
            (inner.finished, inner.wrote, inner.error_flagged)
        };
        if finished || self.mode == AccessMode::ReadOnly {
            return;
        }
        if wrote && !error_flagged {
            if let Err(error) = self.commit_inner() {
                tracing::warn!(
                    store = self.env.name(),
                    "implicit commit on drop failed: {error}"
                );
            }
        }
    }
}

/// Handle to one named database inside a transaction.
pub struct NamedDatabase<'txn, 'env> {
    txn: &'txn Transaction<'env>,
    name: String,
    allow_duplicates: bool,
    /// False when the database does not exist in a read-only
    /// transaction; all reads then return nothing.
    present: bool,
}

impl std::fmt::Debug for NamedDatabase<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedDatabase")
            .field("name", &self.name)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("present", &self.present)
            .finish()
    }
}

impl NamedDatabase<'_, '_> {
    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> String {
        self.txn.store_name(&self.name)
    }

    /// Verifies the stored database-name marker, writing it on first
    /// read-write open.
    fn ensure_correct_database(&self) -> StorageResult<()> {
        let marker = {
            let inner = self.txn.inner.borrow();
            inner.state.get(&self.name).and_then(|table| {
                table.map.get(DB_NAME_MARKER).and_then(|v| v.first().cloned())
            })
        };
        match marker {
            Some(stored) if stored != self.name.as_bytes() => {
                Err(self.txn.report(StorageError::misconfiguration(
                    self.store(),
                    format!(
                        "opened the wrong database: marker says {:?}",
                        String::from_utf8_lossy(&stored)
                    ),
                )))
            }
            Some(_) => Ok(()),
            None => {
                if self.txn.mode == AccessMode::ReadWrite {
                    self.write_raw(DB_NAME_MARKER, self.name.as_bytes())?;
                }
                Ok(())
            }
        }
    }

    /// Writes a key/value pair.
    ///
    /// In a duplicate-key database the value is added to the key's
    /// sorted entry set; otherwise it replaces the previous value.
    ///
    /// # Errors
    ///
    /// Empty keys are rejected; write attempts on a read-only
    /// transaction are a misconfiguration error.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        if key.is_empty() {
            return Err(self
                .txn
                .report(StorageError::new(self.store(), ErrorCode::Generic, "tried to write empty key")));
        }
        self.write_raw(key, value)
    }

    fn write_raw(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        if self.txn.mode != AccessMode::ReadWrite {
            return Err(self.txn.report(StorageError::misconfiguration(
                self.store(),
                "write on a read-only transaction",
            )));
        }
        let mut inner = self.txn.inner.borrow_mut();
        let table = inner
            .state
            .get_mut(&self.name)
            .expect("write-mode open_database creates the table");
        table.put(key.to_vec(), value.to_vec());
        inner.redo.push(LogRecord::Put {
            db: self.name.clone(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        inner.wrote = true;
        Ok(())
    }

    /// Removes a key and all entries under it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the key does not exist.
    pub fn del(&self, key: &[u8]) -> StorageResult<()> {
        self.del_impl(key, None)
    }

    /// Removes one specific duplicate entry under a key.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entry does not exist.
    pub fn del_entry(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.del_impl(key, Some(value))
    }

    fn del_impl(&self, key: &[u8], value: Option<&[u8]>) -> StorageResult<()> {
        if self.txn.mode != AccessMode::ReadWrite {
            return Err(self.txn.report(StorageError::misconfiguration(
                self.store(),
                "delete on a read-only transaction",
            )));
        }
        let mut inner = self.txn.inner.borrow_mut();
        let table = inner
            .state
            .get_mut(&self.name)
            .expect("write-mode open_database creates the table");
        if !table.del(key, value) {
            drop(inner);
            return Err(StorageError::not_found(self.store(), "no entry to delete"));
        }
        inner.redo.push(LogRecord::Del {
            db: self.name.clone(),
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        });
        inner.wrote = true;
        Ok(())
    }

    /// Reads the (first) value stored under `key`.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if !self.present {
            return Ok(None);
        }
        let inner = self.txn.inner.borrow();
        Ok(inner
            .state
            .get(&self.name)
            .and_then(|table| table.map.get(key))
            .and_then(|values| values.first().cloned()))
    }

    /// True if `key` has at least one entry.
    pub fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates entries in ascending key order.
    ///
    /// Without options, a non-empty `prefix` addresses the exact key
    /// (all duplicate entries under it); `find_substring_keys` widens
    /// that to every key starting with the prefix; an empty prefix
    /// always iterates everything. The handler returns `false` to stop.
    /// Returns the number of entries passed to the handler.
    pub fn scan(
        &self,
        prefix: &[u8],
        mut handler: impl FnMut(&[u8], &[u8]) -> bool,
        options: ScanOptions,
    ) -> StorageResult<usize> {
        if !self.present {
            // Reading from a database that does not exist yet yields
            // nothing; callers rely on this for empty stores.
            return Ok(0);
        }
        let inner = self.txn.inner.borrow();
        let Some(table) = inner.state.get(&self.name) else {
            return Ok(0);
        };

        let mut count = 0usize;
        let mut emit = |key: &[u8], value: &[u8]| -> bool {
            if options.skip_internal_keys && is_internal_key(key) {
                return true;
            }
            if key == DB_NAME_MARKER {
                return true;
            }
            count += 1;
            handler(key, value)
        };

        if prefix.is_empty() || options.find_substring_keys {
            'keys: for (key, values) in table.map.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                for value in values {
                    if !emit(key, value) {
                        break 'keys;
                    }
                }
            }
        } else if let Some(values) = table.map.get(prefix) {
            for value in values {
                if !emit(prefix, value) {
                    break;
                }
            }
        }

        Ok(count)
    }

    /// Reports the entry with the greatest key sharing `prefix`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no key matches the prefix.
    pub fn find_latest(
        &self,
        prefix: &[u8],
        handler: impl FnOnce(&[u8], &[u8]),
    ) -> StorageResult<()> {
        let found = if self.present {
            let inner = self.txn.inner.borrow();
            inner.state.get(&self.name).and_then(|table| {
                let mut last: Option<(Vec<u8>, Vec<u8>)> = None;
                for (key, values) in table.map.range(prefix.to_vec()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if key == DB_NAME_MARKER || key.starts_with(INTERNAL_KEY_PREFIX) {
                        continue;
                    }
                    if let Some(value) = values.last() {
                        last = Some((key.clone(), value.clone()));
                    }
                }
                last
            })
        } else {
            None
        };

        match found {
            Some((key, value)) => {
                handler(&key, &value);
                Ok(())
            }
            None => Err(StorageError::not_found(
                self.store(),
                format!("no key matches prefix {:?}", String::from_utf8_lossy(prefix)),
            )),
        }
    }

    /// Number of user-visible entries (excludes internal keys).
    pub fn entry_count(&self) -> StorageResult<usize> {
        let mut count = 0usize;
        self.scan(
            b"",
            |_, _| {
                count += 1;
                true
            },
            ScanOptions {
                find_substring_keys: true,
                skip_internal_keys: true,
            },
        )?;
        Ok(count)
    }

    /// Whether the database allows duplicate keys.
    #[must_use]
    pub fn allows_duplicates(&self) -> bool {
        self.allow_duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;

    #[test]
    fn put_get_roundtrip() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("mail.main", false).unwrap();
        db.put(b"key", b"value").unwrap();
        assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
        txn.commit().unwrap();
    }

    #[test]
    fn empty_key_rejected() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("d", false).unwrap();
        assert!(db.put(b"", b"value").is_err());
    }

    #[test]
    fn snapshot_isolation() {
        let env = Environment::open_in_memory("t");
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"old").unwrap();
            txn.commit().unwrap();
        }

        let reader = env.begin(AccessMode::ReadOnly).unwrap();
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"new").unwrap();
            txn.commit().unwrap();
        }
        // The old snapshot still sees the old value.
        let db = reader.open_database("d", false).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"old".to_vec()));

        let fresh = env.begin(AccessMode::ReadOnly).unwrap();
        let db = fresh.open_database("d", false).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn uncommitted_writes_invisible() {
        let env = Environment::open_in_memory("t");
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"v").unwrap();
            txn.abort();
        }
        let txn = env.begin(AccessMode::ReadOnly).unwrap();
        assert_eq!(txn.open_database("d", false).unwrap().get(b"k").unwrap(), None);
    }

    #[test]
    fn implicit_commit_on_drop() {
        let env = Environment::open_in_memory("t");
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"v").unwrap();
            // No explicit commit.
        }
        let txn = env.begin(AccessMode::ReadOnly).unwrap();
        assert_eq!(
            txn.open_database("d", false).unwrap().get(b"k").unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn flagged_error_aborts_on_drop() {
        let env = Environment::open_in_memory("t");
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"v").unwrap();
            txn.flag_error();
        }
        let txn = env.begin(AccessMode::ReadOnly).unwrap();
        assert_eq!(txn.open_database("d", false).unwrap().get(b"k").unwrap(), None);
    }

    #[test]
    fn duplicate_keys_sorted_and_deduped() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("index", true).unwrap();
        db.put(b"k", b"b").unwrap();
        db.put(b"k", b"a").unwrap();
        db.put(b"k", b"a").unwrap();

        let mut seen = Vec::new();
        db.scan(
            b"k",
            |_, value| {
                seen.push(value.to_vec());
                true
            },
            ScanOptions::default(),
        )
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn del_entry_removes_single_duplicate() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("index", true).unwrap();
        db.put(b"k", b"a").unwrap();
        db.put(b"k", b"b").unwrap();
        db.del_entry(b"k", b"a").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"b".to_vec()));
        assert!(db.del_entry(b"k", b"missing").is_err());
    }

    #[test]
    fn exact_scan_vs_substring_scan() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("d", false).unwrap();
        db.put(b"ab", b"1").unwrap();
        db.put(b"abc", b"2").unwrap();
        db.put(b"b", b"3").unwrap();

        // Exact: only the key itself.
        let exact = db.scan(b"ab", |_, _| true, ScanOptions::default()).unwrap();
        assert_eq!(exact, 1);

        // Substring: every key starting with the prefix.
        let substring = db
            .scan(
                b"ab",
                |_, _| true,
                ScanOptions {
                    find_substring_keys: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(substring, 2);
    }

    #[test]
    fn scan_handler_stops_iteration() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("d", false).unwrap();
        for i in 0u8..5 {
            db.put(&[i + 1], &[i]).unwrap();
        }
        let mut seen = 0;
        db.scan(
            b"",
            |_, _| {
                seen += 1;
                seen < 2
            },
            ScanOptions::default(),
        )
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn internal_keys_skipped() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("d", false).unwrap();
        db.put(b"__internal_marker", b"x").unwrap();
        db.put(b"user", b"y").unwrap();

        let mut keys = Vec::new();
        db.scan(
            b"",
            |key, _| {
                keys.push(key.to_vec());
                true
            },
            ScanOptions {
                skip_internal_keys: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(keys, vec![b"user".to_vec()]);
    }

    #[test]
    fn find_latest_reports_greatest_prefixed_key() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("d", false).unwrap();
        db.put(b"id-0001", b"first").unwrap();
        db.put(b"id-0002", b"second").unwrap();
        db.put(b"other", b"x").unwrap();

        let mut latest = None;
        db.find_latest(b"id-", |key, value| {
            latest = Some((key.to_vec(), value.to_vec()));
        })
        .unwrap();
        assert_eq!(latest, Some((b"id-0002".to_vec(), b"second".to_vec())));
    }

    #[test]
    fn find_latest_missing_prefix_is_not_found() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadWrite).unwrap();
        let db = txn.open_database("d", false).unwrap();
        db.put(b"a", b"1").unwrap();
        let err = db.find_latest(b"zz", |_, _| {}).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_database_scans_zero_rows() {
        let env = Environment::open_in_memory("t");
        let txn = env.begin(AccessMode::ReadOnly).unwrap();
        let db = txn.open_database("never-created", false).unwrap();
        let count = db
            .scan(
                b"",
                |_, _| panic!("handler must not run"),
                ScanOptions::default(),
            )
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(db.get(b"k").unwrap(), None);
    }

    #[test]
    fn wrong_database_marker_detected() {
        let env = Environment::open_in_memory("t");
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            // Simulate a mis-mounted database by planting a marker for
            // another logical name.
            let db = txn.open_database("alias", false).unwrap();
            db.write_raw(DB_NAME_MARKER, b"somethingelse").unwrap();
            txn.commit().unwrap();
        }
        let txn = env.begin(AccessMode::ReadOnly).unwrap();
        let err = txn.open_database("alias", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Misconfiguration);
    }

    #[test]
    fn write_on_read_only_transaction_fails() {
        let env = Environment::open_in_memory("t");
        {
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"v").unwrap();
            txn.commit().unwrap();
        }
        let txn = env.begin(AccessMode::ReadOnly).unwrap();
        let db = txn.open_database("d", false).unwrap();
        let err = db.put(b"k", b"v2").unwrap_err();
        assert_eq!(err.code, ErrorCode::Misconfiguration);
    }
}
