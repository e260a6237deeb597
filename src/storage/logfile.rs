// Single-partition log-structured store.
//
// All values live in an append-only `data.log`; an in-memory index maps each
// key to its latest value and is rebuilt by scanning the log at open. A torn
// or corrupt tail record truncates the log at that offset.

use crate::error::{KvError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const DATA_FILE: &str = "data.log";

/// On-disk record: `crc32: u32 | klen: u32 | vlen: u32 | key | value`,
/// all integers big-endian, CRC over `key || value`.
const RECORD_HEADER: usize = 12;

pub struct LogFileStore {
    path: PathBuf,
    file: Mutex<File>,
    index: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl LogFileStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| KvError::Engine(format!("create {}: {}", dir.display(), e)))?;
        let path = dir.join(DATA_FILE);

        let mut index = HashMap::new();
        let valid_len = match std::fs::read(&path) {
            Ok(data) => Self::scan(&data, &mut index),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(KvError::Engine(format!("read {}: {}", path.display(), e))),
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvError::Engine(format!("open {}: {}", path.display(), e)))?;
        if file
            .metadata()
            .map_err(|e| KvError::Engine(e.to_string()))?
            .len()
            > valid_len
        {
            tracing::warn!(
                "truncating torn tail of {} at offset {}",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)
                .map_err(|e| KvError::Engine(format!("truncate {}: {}", path.display(), e)))?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            index: RwLock::new(index),
        })
    }

    /// Replay records into `index`, returning the byte offset of the first
    /// invalid record (== data.len() when the whole log is sound).
    fn scan(data: &[u8], index: &mut HashMap<Vec<u8>, Vec<u8>>) -> u64 {
        let mut offset = 0usize;
        while data.len() - offset >= RECORD_HEADER {
            let crc = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap());
            let klen =
                u32::from_be_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let vlen =
                u32::from_be_bytes(data[offset + 8..offset + 12].try_into().unwrap()) as usize;

            let body_start = offset + RECORD_HEADER;
            let Some(body_end) = body_start.checked_add(klen + vlen) else {
                break;
            };
            if body_end > data.len() {
                break;
            }
            if crc32fast::hash(&data[body_start..body_end]) != crc {
                break;
            }

            let key = data[body_start..body_start + klen].to_vec();
            let value = data[body_start + klen..body_end].to_vec();
            index.insert(key, value);
            offset = body_end;
        }
        offset as u64
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.index.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Append `ops` to the data log and fsync. The in-memory index is NOT
    /// touched; the caller installs the ops under whatever lock discipline
    /// its batch spans (see `PartitionedStore::write`).
    pub fn append_durable(&self, ops: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut buf = Vec::new();
        for (key, value) in ops {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(key);
            hasher.update(value);
            buf.extend_from_slice(&hasher.finalize().to_be_bytes());
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
        }

        let mut file = self.file.lock();
        file.write_all(&buf)
            .map_err(|e| KvError::Engine(format!("append {}: {}", self.path.display(), e)))?;
        file.sync_data()
            .map_err(|e| KvError::Engine(format!("fsync {}: {}", self.path.display(), e)))
    }

    /// The index lock; exposed so a multi-partition batch can hold several
    /// partitions' write sides at once for all-or-nothing visibility.
    pub(crate) fn index(&self) -> &RwLock<HashMap<Vec<u8>, Vec<u8>>> {
        &self.index
    }
}
