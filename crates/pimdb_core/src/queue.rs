//! Durable message queues feeding the pipeline.
//!
//! Each queue is an append-only file of length-prefixed, checksummed
//! records `{command id, payload}`. Enqueues are durable before they
//! return. After the pipeline commits a drained batch it calls
//! [`MessageQueue::sync_state`], which rewrites the file to the
//! remaining records (rotation); a crash in between replays at most
//! the last batch, whose entity commands then fail as duplicates and
//! are skipped.

use crate::error::{Error, Result};
use pimdb_storage::crc32;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Record envelope: payload length + command id + payload checksum.
const ENVELOPE_LEN: usize = 4 + 4 + 4;

/// A durable FIFO of encoded commands.
pub struct MessageQueue {
    name: String,
    path: PathBuf,
    file: File,
    pending: VecDeque<(u32, Vec<u8>)>,
}

impl MessageQueue {
    /// Opens (or creates) a queue file and loads its pending records.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::transient(format!("open queue {name}: {e}")))?;

        let mut queue = Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            file,
            pending: VecDeque::new(),
        };
        queue.load()?;
        Ok(queue)
    }

    fn load(&mut self) -> Result<()> {
        let mut data = Vec::new();
        self.file
            .read_to_end(&mut data)
            .map_err(|e| Error::transient(format!("read queue {}: {e}", self.name)))?;

        let mut pos = 0usize;
        while pos < data.len() {
            let Some(envelope) = data.get(pos..pos + ENVELOPE_LEN) else {
                tracing::warn!(queue = %self.name, "dropping torn queue record");
                break;
            };
            let len = u32::from_be_bytes(envelope[0..4].try_into().unwrap_or([0; 4])) as usize;
            let command_id = u32::from_be_bytes(envelope[4..8].try_into().unwrap_or([0; 4]));
            let crc = u32::from_be_bytes(envelope[8..12].try_into().unwrap_or([0; 4]));
            let Some(payload) = data.get(pos + ENVELOPE_LEN..pos + ENVELOPE_LEN + len) else {
                tracing::warn!(queue = %self.name, "dropping torn queue record");
                break;
            };
            if crc32(payload) != crc {
                return Err(Error::corruption(format!(
                    "queue {} record checksum mismatch",
                    self.name
                )));
            }
            self.pending.push_back((command_id, payload.to_vec()));
            pos += ENVELOPE_LEN + len;
        }
        Ok(())
    }

    /// Appends a record; durable before return.
    pub fn enqueue(&mut self, command_id: u32, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(ENVELOPE_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&command_id.to_be_bytes());
        frame.extend_from_slice(&crc32(payload).to_be_bytes());
        frame.extend_from_slice(payload);
        self.file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data())
            .map_err(|e| Error::transient(format!("append to queue {}: {e}", self.name)))?;
        self.pending.push_back((command_id, payload.to_vec()));
        Ok(())
    }

    /// Takes the next record.
    pub fn dequeue(&mut self) -> Option<(u32, Vec<u8>)> {
        self.pending.pop_front()
    }

    /// Rewrites the file to the not-yet-drained records.
    pub fn sync_state(&mut self) -> Result<()> {
        let mut data = Vec::new();
        for (command_id, payload) in &self.pending {
            data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            data.extend_from_slice(&command_id.to_be_bytes());
            data.extend_from_slice(&crc32(payload).to_be_bytes());
            data.extend_from_slice(payload);
        }
        // Write-then-rename keeps the old file intact on a crash.
        let path = self.path.clone();
        let tmp_path = path.with_extension("tmp");
        let write = move || -> std::io::Result<File> {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&data)?;
            tmp.sync_data()?;
            std::fs::rename(&tmp_path, &path)?;
            OpenOptions::new().read(true).append(true).open(&path)
        };
        self.file =
            write().map_err(|e| Error::transient(format!("rotate queue {}: {e}", self.name)))?;
        Ok(())
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// The queue's name for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fifo_order() {
        let dir = tempdir().unwrap();
        let mut queue = MessageQueue::open(&dir.path().join("queue.user.log"), "user").unwrap();
        queue.enqueue(1, b"first").unwrap();
        queue.enqueue(2, b"second").unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(), Some((1, b"first".to_vec())));
        assert_eq!(queue.dequeue(), Some((2, b"second".to_vec())));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn pending_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.user.log");
        {
            let mut queue = MessageQueue::open(&path, "user").unwrap();
            queue.enqueue(7, b"payload").unwrap();
        }
        let mut queue = MessageQueue::open(&path, "user").unwrap();
        assert_eq!(queue.dequeue(), Some((7, b"payload".to_vec())));
    }

    #[test]
    fn sync_state_drops_drained_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.sync.log");
        {
            let mut queue = MessageQueue::open(&path, "sync").unwrap();
            queue.enqueue(1, b"a").unwrap();
            queue.enqueue(2, b"b").unwrap();
            queue.dequeue();
            queue.sync_state().unwrap();
        }
        let mut queue = MessageQueue::open(&path, "sync").unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue(), Some((2, b"b".to_vec())));
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.user.log");
        {
            let mut queue = MessageQueue::open(&path, "user").unwrap();
            queue.enqueue(1, b"ok").unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[0, 0, 0, 9, 0]);
        std::fs::write(&path, &raw).unwrap();

        let mut queue = MessageQueue::open(&path, "user").unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue(), Some((1, b"ok".to_vec())));
    }
}
