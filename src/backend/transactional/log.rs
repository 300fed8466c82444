//! Record log
//!
//! Append-only, CRC-framed record file backing the transactional medium.
//! Each mutation is one frame; a frame is either fully present with a
//! matching checksum or it is ignored, which makes every store/remove
//! atomic with respect to crashes.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Frame 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Frame 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! `Data` is a bincode-encoded [`LogRecord`]; the CRC covers the LSN
//! bytes and `Data`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::backend::{check_quota, BackendKind, Usage};
use crate::entry::now_millis;
use crate::error::{Result, StashError};

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single frame payload (64 MB)
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Logs smaller than this are never compacted
const COMPACTION_MIN_BYTES: u64 = 1024 * 1024;

/// A single record in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Timestamp (unix millis) when the record was written
    pub timestamp: u64,

    /// The mutation
    pub op: LogOp,
}

/// Mutations that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Store an entry (JSON-encoded) under a key
    Put { key: String, entry: Vec<u8> },

    /// Remove a key
    Delete { key: String },
}

impl LogRecord {
    pub fn new(lsn: u64, op: LogOp) -> Self {
        Self {
            lsn,
            timestamp: now_millis(),
            op,
        }
    }

    /// Encode as a complete frame (header + data)
    pub fn encode(&self) -> Result<BytesMut> {
        let data = bincode::serialize(self)?;
        if data.len() > MAX_RECORD_SIZE {
            return Err(StashError::Storage(format!(
                "Record too large: {} bytes (max {})",
                data.len(),
                MAX_RECORD_SIZE
            )));
        }

        let lsn_bytes = self.lsn.to_le_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn_bytes);
        hasher.update(&data);

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + data.len());
        frame.put_u64_le(self.lsn);
        frame.put_u32_le(hasher.finalize());
        frame.put_u32_le(data.len() as u32);
        frame.put_slice(&data);
        Ok(frame)
    }
}

/// Outcome of replaying a log file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of records successfully replayed
    pub entries_recovered: u64,

    /// Number of complete frames skipped for a bad checksum
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether a partial frame was cut off the end of the file
    pub was_truncated: bool,
}

/// Parse every frame of `bytes`
///
/// Returns the valid records, the recovery tally and the length of the
/// valid prefix (everything after it is a torn write).
fn scan(bytes: &[u8]) -> (Vec<LogRecord>, RecoveryResult, usize) {
    let mut records = Vec::new();
    let mut result = RecoveryResult::default();
    let mut buf = bytes;
    let mut valid_len = 0;

    while buf.remaining() >= HEADER_SIZE {
        let mut header = &buf[..HEADER_SIZE];
        let lsn = header.get_u64_le();
        let crc = header.get_u32_le();
        let len = header.get_u32_le() as usize;

        if len > MAX_RECORD_SIZE || buf.remaining() < HEADER_SIZE + len {
            break;
        }

        let data = &buf[HEADER_SIZE..HEADER_SIZE + len];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.to_le_bytes());
        hasher.update(data);

        if hasher.finalize() == crc {
            match bincode::deserialize::<LogRecord>(data) {
                Ok(record) => {
                    result.last_lsn = record.lsn;
                    result.entries_recovered += 1;
                    records.push(record);
                }
                Err(e) => {
                    tracing::warn!("Skipping undecodable log record at lsn {}: {}", lsn, e);
                    result.entries_corrupted += 1;
                }
            }
        } else {
            tracing::warn!("Skipping log record with bad checksum at lsn {}", lsn);
            result.entries_corrupted += 1;
        }

        buf.advance(HEADER_SIZE + len);
        valid_len += HEADER_SIZE + len;
    }

    result.was_truncated = valid_len < bytes.len();
    (records, result, valid_len)
}

/// The transactional medium: an indexed record log
///
/// The whole live key set is indexed in memory; the log is the durable
/// copy and is replayed on open.
pub struct LogStore {
    path: PathBuf,
    file: File,
    /// Live entries: key → JSON-encoded entry
    index: BTreeMap<String, Vec<u8>>,
    /// Sum of live key and entry sizes
    live_bytes: u64,
    /// Current size of the log file
    log_bytes: u64,
    next_lsn: u64,
    quota: Option<u64>,
}

impl LogStore {
    const FILENAME: &'static str = "records.log";

    /// Open the log under `dir`, replaying and repairing it
    pub fn open(dir: &Path, quota: Option<u64>) -> Result<(Self, RecoveryResult)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILENAME);

        let mut bytes = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut bytes)?;
        }

        let (records, recovery, valid_len) = scan(&bytes);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if recovery.was_truncated {
            tracing::warn!(
                "Truncating torn tail of {:?}: {} -> {} bytes",
                path,
                bytes.len(),
                valid_len
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let mut index = BTreeMap::new();
        for record in records {
            match record.op {
                LogOp::Put { key, entry } => {
                    index.insert(key, entry);
                }
                LogOp::Delete { key } => {
                    index.remove(&key);
                }
            }
        }

        if recovery.entries_recovered > 0 || recovery.entries_corrupted > 0 {
            tracing::info!(
                "Log recovery: {} records recovered, {} corrupted, last_lsn={}",
                recovery.entries_recovered,
                recovery.entries_corrupted,
                recovery.last_lsn
            );
        }

        let live_bytes = index.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
        let mut store = Self {
            path,
            file,
            index,
            live_bytes,
            log_bytes: valid_len as u64,
            next_lsn: recovery.last_lsn + 1,
            quota,
        };
        store.seek_end()?;

        Ok((store, recovery))
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.index.get(key).map(Vec::as_slice)
    }

    pub fn put(&mut self, key: &str, entry: Vec<u8>) -> Result<()> {
        let replaced = self
            .index
            .get(key)
            .map(|v| (key.len() + v.len()) as u64)
            .unwrap_or(0);
        let incoming = (key.len() + entry.len()) as u64;
        check_quota(
            BackendKind::Transactional,
            self.quota,
            self.live_bytes,
            replaced,
            incoming,
        )?;

        self.append(LogOp::Put {
            key: key.to_string(),
            entry: entry.clone(),
        })?;
        self.index.insert(key.to_string(), entry);
        self.live_bytes = self.live_bytes - replaced + incoming;
        self.maybe_compact()
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let Some(old) = self.index.get(key) else {
            return Ok(());
        };
        let removed = (key.len() + old.len()) as u64;

        self.append(LogOp::Delete {
            key: key.to_string(),
        })?;
        self.index.remove(key);
        self.live_bytes -= removed;
        self.maybe_compact()
    }

    /// Drop every record and start an empty log
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.index.clear();
        self.live_bytes = 0;
        self.log_bytes = 0;
        self.seek_end()
    }

    pub fn keys(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn usage(&self) -> Usage {
        Usage {
            items: self.index.len() as u64,
            bytes: self.live_bytes,
        }
    }

    /// Current size of the log file in bytes
    pub fn log_bytes(&self) -> u64 {
        self.log_bytes
    }

    /// Rewrite the log so it holds one Put per live key
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("log.compact");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut written = 0u64;
        let mut lsn = self.next_lsn;
        for (key, entry) in &self.index {
            let frame = LogRecord::new(
                lsn,
                LogOp::Put {
                    key: key.clone(),
                    entry: entry.clone(),
                },
            )
            .encode()?;
            tmp.write_all(&frame)?;
            written += frame.len() as u64;
            lsn += 1;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.seek_end()?;

        tracing::debug!(
            "Compacted {:?}: {} -> {} bytes",
            self.path,
            self.log_bytes,
            written
        );
        self.log_bytes = written;
        self.next_lsn = lsn;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.log_bytes > COMPACTION_MIN_BYTES && self.log_bytes > self.live_bytes * 2 {
            self.compact()?;
        }
        Ok(())
    }

    fn append(&mut self, op: LogOp) -> Result<()> {
        let record = LogRecord::new(self.next_lsn, op);
        let frame = record.encode()?;

        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        tracing::trace!("Appended log record lsn={} ({} bytes)", record.lsn, frame.len());
        self.next_lsn += 1;
        self.log_bytes += frame.len() as u64;
        Ok(())
    }

    fn seek_end(&mut self) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}
