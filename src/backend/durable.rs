//! Durable backend
//!
//! A synchronous string key/value store persisted as a single snapshot
//! file. Every mutation rewrites the snapshot to a temporary file and
//! renames it over the old one, so a crash leaves either the old or the
//! new snapshot, never a mix.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "STKV" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Key][Value]                │
//! │   ... repeated for each entry ...                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (8 bytes)                                        │
//! │   DataCRC: u32 (4) | Padding (4)                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::entry::StoredEntry;
use crate::error::{Result, StashError};

use super::{check_quota, BackendAdapter, BackendKind, Usage};

/// Magic bytes identifying a StashKV snapshot file
const MAGIC: &[u8; 4] = b"STKV";

/// Current snapshot format version
const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
const HEADER_SIZE: usize = 14;

/// Footer size: DataCRC (4) + Padding (4) = 8 bytes
const FOOTER_SIZE: usize = 8;

/// Snapshot-file key/value store
pub struct DurableStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, String>>,
    quota: Option<u64>,
}

impl DurableStore {
    const FILENAME: &'static str = "durable.kv";

    /// Open (or create) the snapshot under `dir`
    ///
    /// A corrupt snapshot makes the open fail; the caller then treats the
    /// medium as unavailable and leaves the file untouched.
    pub fn open(dir: &Path, quota: Option<u64>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILENAME);

        let data = if path.exists() {
            read_snapshot(&path)?
        } else {
            // Probe writability up front so an unwritable directory
            // surfaces as unavailability rather than as failed writes later
            write_snapshot(&path, &BTreeMap::new())?;
            BTreeMap::new()
        };

        tracing::debug!("Durable store opened at {:?} with {} entries", path, data.len());

        Ok(Self {
            path,
            data: RwLock::new(data),
            quota,
        })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackendAdapter for DurableStore {
    fn store(&self, key: &str, entry: &StoredEntry) -> Result<()> {
        let text = entry.to_json()?;
        let mut data = self.data.write();

        let current: u64 = data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
        let replaced = data.get(key).map(|v| (key.len() + v.len()) as u64).unwrap_or(0);
        let incoming = (key.len() + text.len()) as u64;
        check_quota(BackendKind::Durable, self.quota, current, replaced, incoming)?;

        let previous = data.insert(key.to_string(), text);
        if let Err(e) = write_snapshot(&self.path, &data) {
            // Keep memory and disk in agreement
            match previous {
                Some(old) => data.insert(key.to_string(), old),
                None => data.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        let data = self.data.read();
        match data.get(key) {
            Some(text) => Ok(Some(StoredEntry::from_json(text)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.write();
        if let Some(old) = data.remove(key) {
            if let Err(e) = write_snapshot(&self.path, &data) {
                data.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut data = self.data.write();
        write_snapshot(&self.path, &BTreeMap::new())?;
        data.clear();
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn measure_usage(&self) -> Result<Usage> {
        let data = self.data.read();
        Ok(Usage {
            items: data.len() as u64,
            bytes: data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum(),
        })
    }
}

// =============================================================================
// Snapshot Encoding
// =============================================================================

/// Write the full map to a temporary file, then rename it into place
fn write_snapshot(path: &Path, data: &BTreeMap<String, String>) -> Result<()> {
    let tmp_path = path.with_extension("kv.tmp");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(data.len() as u64).to_le_bytes())?;

    let mut hasher = crc32fast::Hasher::new();
    for (key, value) in data {
        let key_len = (key.len() as u32).to_le_bytes();
        let val_len = (value.len() as u32).to_le_bytes();

        writer.write_all(&key_len)?;
        writer.write_all(&val_len)?;
        writer.write_all(key.as_bytes())?;
        writer.write_all(value.as_bytes())?;

        hasher.update(&key_len);
        hasher.update(&val_len);
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }

    writer.write_all(&hasher.finalize().to_le_bytes())?;
    writer.write_all(&[0u8; 4])?; // Padding for alignment
    writer.flush()?;

    let file = writer
        .into_inner()
        .map_err(|e| StashError::Storage(format!("Failed to flush snapshot: {}", e)))?;
    file.sync_all()?;

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and verify a snapshot file
fn read_snapshot(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(StashError::Storage(format!(
            "Snapshot too short: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[0..4] != MAGIC {
        return Err(StashError::Storage(format!(
            "Invalid snapshot magic: expected STKV, got {:?}",
            &bytes[0..4]
        )));
    }

    let version = read_u16(&bytes, 4);
    if version != VERSION {
        return Err(StashError::Storage(format!(
            "Unsupported snapshot version: {}",
            version
        )));
    }
    let entry_count = read_u64(&bytes, 6);

    let data_end = bytes.len() - FOOTER_SIZE;
    let data_block = &bytes[HEADER_SIZE..data_end];
    let stored_crc = read_u32(&bytes, data_end);
    if crc32fast::hash(data_block) != stored_crc {
        return Err(StashError::Storage("Snapshot checksum mismatch".to_string()));
    }

    let mut map = BTreeMap::new();
    let mut pos = 0;
    while pos < data_block.len() {
        if pos + 8 > data_block.len() {
            return Err(StashError::Storage("Truncated snapshot entry header".to_string()));
        }
        let key_len = read_u32(data_block, pos) as usize;
        let val_len = read_u32(data_block, pos + 4) as usize;
        pos += 8;

        if pos + key_len + val_len > data_block.len() {
            return Err(StashError::Storage("Truncated snapshot entry".to_string()));
        }
        let key = utf8(&data_block[pos..pos + key_len])?;
        pos += key_len;
        let value = utf8(&data_block[pos..pos + val_len])?;
        pos += val_len;

        map.insert(key, value);
    }

    if map.len() as u64 != entry_count {
        return Err(StashError::Storage(format!(
            "Snapshot entry count mismatch: header says {}, found {}",
            entry_count,
            map.len()
        )));
    }

    Ok(map)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| StashError::Storage(format!("Snapshot holds invalid UTF-8: {}", e)))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
