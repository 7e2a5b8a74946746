/// Record store boundary
///
/// The recorder appends encoded records per routing key; the store owns
/// durability. Writes for one routing key must land in call order, and writers
/// for distinct keys must not interfere.
///
/// File layout for `FileStore`, one `<routing_key>.log` per key, each entry:
///   [timestamp_ns: i64][record_len: u32][record: bytes]

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StoreError;

pub const ENTRY_HEADER_SIZE: usize = 12;

pub trait RecordStore: Send + Sync {
    fn write(&self, timestamp: DateTime<Utc>, routing_key: &str, record: &[u8]) -> Result<(), StoreError>;

    /// Make previously written records durable. No-op by default.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// In-memory store, mainly for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: Mutex<HashMap<String, Vec<StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written under a routing key, in write order
    pub fn records(&self, routing_key: &str) -> Vec<StoredRecord> {
        self.partitions
            .lock()
            .get(routing_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.partitions.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn total_records(&self) -> usize {
        self.partitions.lock().values().map(Vec::len).sum()
    }
}

impl RecordStore for MemoryStore {
    fn write(&self, timestamp: DateTime<Utc>, routing_key: &str, record: &[u8]) -> Result<(), StoreError> {
        self.partitions
            .lock()
            .entry(routing_key.to_string())
            .or_default()
            .push(StoredRecord {
                timestamp,
                bytes: record.to_vec(),
            });
        Ok(())
    }
}

/// Append-only file per routing key
pub struct FileStore {
    dir: PathBuf,
    writers: Mutex<HashMap<String, BufWriter<File>>>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStore {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, routing_key: &str) -> PathBuf {
        self.dir.join(format!("{}.log", routing_key))
    }

    fn validate_key(routing_key: &str) -> Result<(), StoreError> {
        let valid = !routing_key.is_empty()
            && routing_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && routing_key != "."
            && routing_key != "..";
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidRoutingKey(routing_key.to_string()))
        }
    }

    /// Read back every entry of a routing key's log
    pub fn read_all(&self, routing_key: &str) -> Result<Vec<StoredRecord>, StoreError> {
        Self::validate_key(routing_key)?;
        self.sync()?;
        let data = fs::read(self.path_for(routing_key))?;
        Ok(parse_entries(&data))
    }
}

impl RecordStore for FileStore {
    fn write(&self, timestamp: DateTime<Utc>, routing_key: &str, record: &[u8]) -> Result<(), StoreError> {
        Self::validate_key(routing_key)?;

        let mut writers = self.writers.lock();
        if !writers.contains_key(routing_key) {
            let path = self.path_for(routing_key);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(path = %path.display(), "opened record log");
            writers.insert(routing_key.to_string(), BufWriter::new(file));
        }
        let writer = writers
            .get_mut(routing_key)
            .ok_or_else(|| StoreError::InvalidRoutingKey(routing_key.to_string()))?;

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        LittleEndian::write_i64(&mut header[0..8], timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX));
        LittleEndian::write_u32(&mut header[8..12], record.len() as u32);
        writer.write_all(&header)?;
        writer.write_all(record)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        for writer in self.writers.lock().values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        for writer in self.writers.get_mut().values_mut() {
            let _ = writer.flush();
        }
    }
}

// Stops at the first incomplete entry (torn tail write)
fn parse_entries(data: &[u8]) -> Vec<StoredRecord> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while data.len() - offset >= ENTRY_HEADER_SIZE {
        let nanos = LittleEndian::read_i64(&data[offset..offset + 8]);
        let len = LittleEndian::read_u32(&data[offset + 8..offset + 12]) as usize;
        let start = offset + ENTRY_HEADER_SIZE;
        if data.len() - start < len {
            break;
        }
        entries.push(StoredRecord {
            timestamp: DateTime::from_timestamp_nanos(nanos),
            bytes: data[start..start + len].to_vec(),
        });
        offset = start + len;
    }
    entries
}
