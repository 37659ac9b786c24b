//! Storage environments and the process-wide environment registry.

use crate::error::{basic_error_handler, ErrorHandler, StorageError, StorageResult};
use crate::log::{read_committed, LogRecord, LogWriter};
use crate::txn::{State, Table, Transaction};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Data log file inside an environment directory.
const DATA_FILE: &str = "data.mdb";
/// Writer exclusion lock file inside an environment directory.
const LOCK_FILE: &str = "lock.mdb";

/// Access mode for environments and transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Snapshot reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// One storage environment: a directory of named databases.
///
/// Environments are shared process-wide: [`Environment::open`] returns
/// the same instance for the same path until
/// [`Environment::remove_from_disk`] releases it. The environment owns
/// the committed state; transactions borrow from it.
pub struct Environment {
    name: String,
    path: Option<PathBuf>,
    mode: AccessMode,
    pub(crate) state: RwLock<State>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) log: Option<Mutex<LogWriter>>,
    pub(crate) default_error_handler: RwLock<ErrorHandler>,
    _lock_file: Option<File>,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<Environment>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Environment>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Environment {
    /// Opens (or joins) the environment at `path`.
    ///
    /// Exactly one environment is kept alive per path; concurrent
    /// callers share it. Requesting `ReadWrite` on a path whose shared
    /// environment was opened `ReadOnly` is a misconfiguration error.
    ///
    /// # Errors
    ///
    /// - `Misconfiguration` on mode conflicts or a missing directory in
    ///   read-only mode
    /// - `Transient` when another process holds the writer lock
    /// - `Corruption` when the data log fails checksum validation
    pub fn open(path: &Path, mode: AccessMode) -> StorageResult<Arc<Environment>> {
        let mut reg = registry().lock();
        if let Some(existing) = reg.get(path) {
            if mode == AccessMode::ReadWrite && existing.mode == AccessMode::ReadOnly {
                return Err(StorageError::misconfiguration(
                    existing.name.clone(),
                    "requested read/write access on a read-only environment",
                ));
            }
            return Ok(Arc::clone(existing));
        }

        let env = Arc::new(Self::open_uncached(path, mode)?);
        reg.insert(path.to_path_buf(), Arc::clone(&env));
        Ok(env)
    }

    fn open_uncached(path: &Path, mode: AccessMode) -> StorageResult<Environment> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if !path.exists() {
            if mode == AccessMode::ReadOnly {
                return Err(StorageError::misconfiguration(
                    name,
                    format!("environment directory does not exist: {}", path.display()),
                ));
            }
            std::fs::create_dir_all(path).map_err(|e| StorageError::io(&name, &e))?;
        }

        // One writer per environment across processes.
        let lock_file = if mode == AccessMode::ReadWrite {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path.join(LOCK_FILE))
                .map_err(|e| StorageError::io(&name, &e))?;
            if file.try_lock_exclusive().is_err() {
                return Err(StorageError::new(
                    name,
                    crate::ErrorCode::Transient,
                    "another process has exclusive access to this environment",
                ));
            }
            Some(file)
        } else {
            None
        };

        let data_path = path.join(DATA_FILE);
        let (records, committed_end) = read_committed(&data_path, &name)?;
        let state = replay(&records);

        let log = if mode == AccessMode::ReadWrite {
            // Drop any torn tail before appending new runs after it.
            let mut writer = LogWriter::open(&data_path, &name)?;
            let actual_len = std::fs::metadata(&data_path)
                .map(|m| m.len())
                .unwrap_or(committed_end);
            if actual_len > committed_end {
                tracing::warn!(
                    store = %name,
                    dropped = actual_len - committed_end,
                    "truncating torn tail of data log"
                );
                rewrite_compacted(&mut writer, &state, &name)?;
            }
            Some(Mutex::new(writer))
        } else {
            None
        };

        Ok(Environment {
            name,
            path: Some(path.to_path_buf()),
            mode,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            log,
            default_error_handler: RwLock::new(basic_error_handler()),
            _lock_file: lock_file,
        })
    }

    /// Opens an ephemeral in-memory environment (tests, tooling).
    ///
    /// Not registered process-wide and never persisted.
    #[must_use]
    pub fn open_in_memory(name: &str) -> Arc<Environment> {
        Arc::new(Environment {
            name: name.to_string(),
            path: None,
            mode: AccessMode::ReadWrite,
            state: RwLock::new(State::new()),
            write_lock: Mutex::new(()),
            log: None,
            default_error_handler: RwLock::new(basic_error_handler()),
            _lock_file: None,
        })
    }

    /// The environment's display name (directory name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The environment's access mode.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Replaces the default error handler for this environment.
    pub fn set_default_error_handler(&self, handler: ErrorHandler) {
        *self.default_error_handler.write() = handler;
    }

    /// Begins a transaction.
    ///
    /// A read transaction captures a consistent snapshot and holds no
    /// locks. A write transaction acquires the single-writer lock for
    /// its lifetime; dropping it commits implicitly if anything was
    /// written and no error was flagged, otherwise aborts.
    ///
    /// # Errors
    ///
    /// Requesting a write transaction on a read-only environment is a
    /// misconfiguration error.
    pub fn begin(&self, mode: AccessMode) -> StorageResult<Transaction<'_>> {
        if mode == AccessMode::ReadWrite && self.mode == AccessMode::ReadOnly {
            return Err(StorageError::misconfiguration(
                self.name.clone(),
                "requested read/write transaction in read-only mode",
            ));
        }
        Ok(Transaction::new(self, mode))
    }

    /// Names of all databases present in the committed state.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes the environment on last release and deletes its files.
    ///
    /// The environment is removed from the process-wide registry, so a
    /// later [`Environment::open`] starts fresh.
    pub fn remove_from_disk(path: &Path) -> StorageResult<()> {
        let removed = registry().lock().remove(path);
        let name = removed
            .as_ref()
            .map(|env| env.name.clone())
            .unwrap_or_else(|| path.display().to_string());
        // Dropping the registry Arc releases the writer lock once the
        // last outside holder is gone; the directory can be removed
        // immediately because all content is ours.
        drop(removed);
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|e| StorageError::io(&name, &e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("databases", &self.state.read().len())
            .finish_non_exhaustive()
    }
}

/// Builds the in-memory state from replayed committed records.
fn replay(records: &[LogRecord]) -> State {
    let mut state = State::new();
    for record in records {
        match record {
            LogRecord::OpenDb {
                name,
                allow_duplicates,
            } => {
                state
                    .entry(name.clone())
                    .or_insert_with(|| Table::new(*allow_duplicates));
            }
            LogRecord::Put { db, key, value } => {
                if let Some(table) = state.get_mut(db) {
                    table.put(key.clone(), value.clone());
                }
            }
            LogRecord::Del { db, key, value } => {
                if let Some(table) = state.get_mut(db) {
                    table.del(key, value.as_deref());
                }
            }
            LogRecord::Commit => {}
        }
    }
    state
}

/// Rewrites the log to contain exactly the given state.
fn rewrite_compacted(writer: &mut LogWriter, state: &State, store: &str) -> StorageResult<()> {
    writer.truncate(store)?;
    let mut names: Vec<&String> = state.keys().collect();
    names.sort();
    for name in names {
        let table = &state[name];
        writer.append(
            &LogRecord::OpenDb {
                name: name.clone(),
                allow_duplicates: table.allow_duplicates,
            },
            store,
        )?;
        for (key, values) in table.map.iter() {
            for value in values {
                writer.append(
                    &LogRecord::Put {
                        db: name.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    },
                    store,
                )?;
            }
        }
    }
    writer.append(&LogRecord::Commit, store)?;
    writer.sync(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn same_path_shares_environment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared");
        let a = Environment::open(&path, AccessMode::ReadWrite).unwrap();
        let b = Environment::open(&path, AccessMode::ReadWrite).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        Environment::remove_from_disk(&path).unwrap();
    }

    #[test]
    fn read_only_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let result = Environment::open(&dir.path().join("absent"), AccessMode::ReadOnly);
        assert!(result.is_err());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("durable");
        {
            let env = Environment::open(&path, AccessMode::ReadWrite).unwrap();
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            let db = txn.open_database("mail.main", false).unwrap();
            db.put(b"key", b"value").unwrap();
            txn.commit().unwrap();
            Environment::remove_from_registry_for_tests(&path);
        }
        {
            let env = Environment::open(&path, AccessMode::ReadWrite).unwrap();
            let txn = env.begin(AccessMode::ReadOnly).unwrap();
            let db = txn.open_database("mail.main", false).unwrap();
            assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
            Environment::remove_from_registry_for_tests(&path);
        }
    }

    #[test]
    fn remove_from_disk_clears_registry_and_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("removable");
        {
            let env = Environment::open(&path, AccessMode::ReadWrite).unwrap();
            let txn = env.begin(AccessMode::ReadWrite).unwrap();
            txn.open_database("d", false).unwrap().put(b"k", b"v").unwrap();
            txn.commit().unwrap();
        }
        Environment::remove_from_disk(&path).unwrap();
        assert!(!path.exists());

        let env = Environment::open(&path, AccessMode::ReadWrite).unwrap();
        assert!(env.database_names().is_empty());
        Environment::remove_from_disk(&path).unwrap();
    }

    #[test]
    fn in_memory_environment_is_private() {
        let a = Environment::open_in_memory("a");
        let b = Environment::open_in_memory("a");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}

#[cfg(test)]
impl Environment {
    /// Drops the registry entry so tests can simulate a process restart.
    pub(crate) fn remove_from_registry_for_tests(path: &Path) {
        registry().lock().remove(path);
    }
}
