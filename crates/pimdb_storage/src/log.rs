//! Redo log framing and replay.
//!
//! Committed write transactions are appended as a run of operation
//! records terminated by a `Commit` record. Replay applies only complete
//! runs; a torn tail left by a crash is truncated away.

use crate::error::{ErrorCode, StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic bytes of every log record.
const LOG_MAGIC: [u8; 4] = *b"PLOG";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Record envelope: magic + version + type + payload length + crc.
const ENVELOPE_LEN: usize = 4 + 1 + 1 + 4 + 4;

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    OpenDb = 1,
    Put = 2,
    Del = 3,
    Commit = 4,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::OpenDb),
            2 => Some(Self::Put),
            3 => Some(Self::Del),
            4 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A single redo log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A named database was created.
    OpenDb {
        /// Database name.
        name: String,
        /// Whether the database allows duplicate keys.
        allow_duplicates: bool,
    },
    /// A key/value pair was written.
    Put {
        /// Database name.
        db: String,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// A key (or one duplicate entry under it) was removed.
    Del {
        /// Database name.
        db: String,
        /// Key bytes.
        key: Vec<u8>,
        /// When set, only this duplicate value is removed.
        value: Option<Vec<u8>>,
    },
    /// Terminates a committed run of operations.
    Commit,
}

impl LogRecord {
    fn record_type(&self) -> RecordType {
        match self {
            Self::OpenDb { .. } => RecordType::OpenDb,
            Self::Put { .. } => RecordType::Put,
            Self::Del { .. } => RecordType::Del,
            Self::Commit => RecordType::Commit,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::OpenDb {
                name,
                allow_duplicates,
            } => {
                write_chunk(&mut buf, name.as_bytes());
                buf.push(u8::from(*allow_duplicates));
            }
            Self::Put { db, key, value } => {
                write_chunk(&mut buf, db.as_bytes());
                write_chunk(&mut buf, key);
                write_chunk(&mut buf, value);
            }
            Self::Del { db, key, value } => {
                write_chunk(&mut buf, db.as_bytes());
                write_chunk(&mut buf, key);
                match value {
                    Some(v) => {
                        buf.push(1);
                        write_chunk(&mut buf, v);
                    }
                    None => buf.push(0),
                }
            }
            Self::Commit => {}
        }
        buf
    }

    fn decode_payload(record_type: RecordType, payload: &[u8], store: &str) -> StorageResult<Self> {
        let mut pos = 0usize;
        let corrupt = |msg: &str| StorageError::corruption(store, msg);
        match record_type {
            RecordType::OpenDb => {
                let name = read_chunk(payload, &mut pos).ok_or_else(|| corrupt("short OpenDb"))?;
                let flag = *payload.get(pos).ok_or_else(|| corrupt("short OpenDb"))?;
                Ok(Self::OpenDb {
                    name: String::from_utf8(name.to_vec())
                        .map_err(|_| corrupt("OpenDb name not UTF-8"))?,
                    allow_duplicates: flag != 0,
                })
            }
            RecordType::Put => {
                let db = read_chunk(payload, &mut pos).ok_or_else(|| corrupt("short Put"))?;
                let key = read_chunk(payload, &mut pos).ok_or_else(|| corrupt("short Put"))?;
                let value = read_chunk(payload, &mut pos).ok_or_else(|| corrupt("short Put"))?;
                Ok(Self::Put {
                    db: String::from_utf8(db.to_vec()).map_err(|_| corrupt("Put db not UTF-8"))?,
                    key: key.to_vec(),
                    value: value.to_vec(),
                })
            }
            RecordType::Del => {
                let db = read_chunk(payload, &mut pos).ok_or_else(|| corrupt("short Del"))?;
                let key = read_chunk(payload, &mut pos).ok_or_else(|| corrupt("short Del"))?;
                let has_value = *payload.get(pos).ok_or_else(|| corrupt("short Del"))?;
                pos += 1;
                let value = if has_value != 0 {
                    Some(
                        read_chunk(payload, &mut pos)
                            .ok_or_else(|| corrupt("short Del value"))?
                            .to_vec(),
                    )
                } else {
                    None
                };
                Ok(Self::Del {
                    db: String::from_utf8(db.to_vec()).map_err(|_| corrupt("Del db not UTF-8"))?,
                    key: key.to_vec(),
                    value,
                })
            }
            RecordType::Commit => Ok(Self::Commit),
        }
    }
}

fn write_chunk(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn read_chunk<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len_bytes = buf.get(*pos..*pos + 4)?;
    let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
    *pos += 4;
    let chunk = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(chunk)
}

/// Appends records to the redo log with checksummed framing.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    /// Opens the log for appending, creating it if missing.
    pub fn open(path: &Path, store: &str) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| StorageError::io(store, &e))?;
        Ok(Self { file })
    }

    /// Appends one record without flushing.
    pub fn append(&mut self, record: &LogRecord, store: &str) -> StorageResult<()> {
        let payload = record.encode_payload();
        let mut frame = Vec::with_capacity(ENVELOPE_LEN + payload.len());
        frame.extend_from_slice(&LOG_MAGIC);
        frame.push(LOG_VERSION);
        frame.push(record.record_type() as u8);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc32(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);
        self.file
            .write_all(&frame)
            .map_err(|e| StorageError::io(store, &e))
    }

    /// Flushes buffered appends to durable storage.
    pub fn sync(&mut self, store: &str) -> StorageResult<()> {
        self.file
            .sync_data()
            .map_err(|e| StorageError::io(store, &e))
    }

    /// Discards all content; used when rewriting a compacted log.
    pub fn truncate(&mut self, store: &str) -> StorageResult<()> {
        self.file
            .set_len(0)
            .and_then(|()| self.file.seek(SeekFrom::Start(0)).map(|_| ()))
            .map_err(|e| StorageError::io(store, &e))
    }
}

/// Reads every complete committed run from the log.
///
/// Returns the committed records in order and the byte offset of the
/// first incomplete (torn) record, which the caller may truncate at.
/// A checksum mismatch *before* the tail is a corruption error; a short
/// or damaged final record is treated as a torn append.
pub fn read_committed(path: &Path, store: &str) -> StorageResult<(Vec<LogRecord>, u64)> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(StorageError::io(store, &e)),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| StorageError::io(store, &e))?;

    let mut records = Vec::new();
    let mut pending = Vec::new();
    let mut pos = 0usize;
    let mut committed_end = 0u64;

    while pos < data.len() {
        let Some(envelope) = data.get(pos..pos + ENVELOPE_LEN) else {
            break; // torn envelope
        };
        if envelope[0..4] != LOG_MAGIC {
            return Err(StorageError::corruption(store, "bad log record magic"));
        }
        if envelope[4] != LOG_VERSION {
            return Err(StorageError::new(
                store,
                ErrorCode::Misconfiguration,
                format!("unsupported log version {}", envelope[4]),
            ));
        }
        let Some(record_type) = RecordType::from_byte(envelope[5]) else {
            return Err(StorageError::corruption(store, "unknown log record type"));
        };
        let len = u32::from_be_bytes(envelope[6..10].try_into().unwrap_or([0; 4])) as usize;
        let crc = u32::from_be_bytes(envelope[10..14].try_into().unwrap_or([0; 4]));
        let Some(payload) = data.get(pos + ENVELOPE_LEN..pos + ENVELOPE_LEN + len) else {
            break; // torn payload
        };
        if crc32(payload) != crc {
            // A bad checksum on the very last record is a torn append;
            // anywhere else it is corruption.
            if pos + ENVELOPE_LEN + len >= data.len() {
                break;
            }
            return Err(StorageError::corruption(store, "log record checksum mismatch"));
        }
        let record = LogRecord::decode_payload(record_type, payload, store)?;
        pos += ENVELOPE_LEN + len;
        match record {
            LogRecord::Commit => {
                records.append(&mut pending);
                committed_end = pos as u64;
            }
            other => pending.push(other),
        }
    }

    Ok((records, committed_end))
}

/// CRC32 (IEEE) over the payload, table-driven.
pub fn crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = build_crc32_table();
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord::OpenDb {
                name: "mail.main".into(),
                allow_duplicates: false,
            },
            LogRecord::Put {
                db: "mail.main".into(),
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            },
            LogRecord::Del {
                db: "mail.main".into(),
                key: b"k1".to_vec(),
                value: None,
            },
        ]
    }

    #[test]
    fn roundtrip_committed_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.mdb");

        let mut writer = LogWriter::open(&path, "test").unwrap();
        for record in sample_records() {
            writer.append(&record, "test").unwrap();
        }
        writer.append(&LogRecord::Commit, "test").unwrap();
        writer.sync("test").unwrap();

        let (records, _) = read_committed(&path, "test").unwrap();
        assert_eq!(records, sample_records());
    }

    #[test]
    fn uncommitted_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.mdb");

        let mut writer = LogWriter::open(&path, "test").unwrap();
        writer
            .append(
                &LogRecord::Put {
                    db: "d".into(),
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                "test",
            )
            .unwrap();
        writer.append(&LogRecord::Commit, "test").unwrap();
        // Second run never commits.
        writer
            .append(
                &LogRecord::Put {
                    db: "d".into(),
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
                "test",
            )
            .unwrap();
        writer.sync("test").unwrap();

        let (records, end) = read_committed(&path, "test").unwrap();
        assert_eq!(records.len(), 1);
        assert!(end > 0);
        assert!(end < std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn torn_record_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.mdb");

        let mut writer = LogWriter::open(&path, "test").unwrap();
        writer.append(&LogRecord::Commit, "test").unwrap();
        writer.sync("test").unwrap();

        // Simulate a crash mid-append.
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"PLOG\x01\x02");
        std::fs::write(&path, &raw).unwrap();

        let (records, _) = read_committed(&path, "test").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let (records, end) = read_committed(&dir.path().join("absent"), "test").unwrap();
        assert!(records.is_empty());
        assert_eq!(end, 0);
    }

    #[test]
    fn crc32_known_value() {
        // Standard IEEE CRC32 of "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
