// Write-ahead log.
//
// Redo-only log shared by every database. Appends go to a rolling segment
// file `wal.NNN`; `wal.meta` holds the last LSN whose effects are known
// durable in the engine. Records between meta and the log tail are
// re-applied on recovery (blind overwrites, so replay is idempotent).

use crate::error::{KvError, Result};
use crate::storage::{KvStore, PartitionedStore, WriteBatch};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Log sequence number; strictly monotonic per WAL.
pub type Lsn = u64;

pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

const META_FILE: &str = "wal.meta";
const META_TMP_FILE: &str = "wal.meta.tmp";

/// One redo record: every key→value assignment of one committed batch
/// against one database.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub db: String,
    pub ops: Vec<(Vec<u8>, Vec<u8>)>,
}

/// On-disk record framing: `body_len: u32 BE | body (bincode) | crc32(body):
/// u32 BE`.
const FRAME_OVERHEAD: u64 = 8;

struct Appender {
    file: File,
    segment_no: u32,
    segment_len: u64,
    last_lsn: Lsn,
}

pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    appender: Mutex<Appender>,
    meta_lock: Mutex<()>,
    committed: AtomicU64,
}

impl Wal {
    /// Open the WAL under `dir`, validating segments against `wal.meta`.
    ///
    /// Returns the WAL plus every entry with `lsn > meta` in log order; the
    /// caller replays those into the engine and then advances meta. A
    /// corrupt record truncates its segment at that offset and discards all
    /// later segments.
    pub fn open(dir: &Path, segment_size: u64) -> Result<(Self, Vec<WalEntry>)> {
        std::fs::create_dir_all(dir)
            .map_err(|e| KvError::Wal(format!("create {}: {}", dir.display(), e)))?;

        let committed = read_meta(&dir.join(META_FILE))?;

        let mut segments = list_segments(dir)?;
        segments.sort_unstable();

        let mut pending = Vec::new();
        let mut last_lsn = committed;
        let mut tail: Option<(u32, u64)> = None;

        for (idx, &seg_no) in segments.iter().enumerate() {
            let path = segment_path(dir, seg_no);
            let data = std::fs::read(&path)
                .map_err(|e| KvError::Wal(format!("read {}: {}", path.display(), e)))?;
            let (entries, valid_len, clean) = scan_segment(&data);

            for entry in entries {
                if entry.lsn <= committed {
                    continue;
                }
                last_lsn = last_lsn.max(entry.lsn);
                pending.push(entry);
            }

            if !clean {
                tracing::warn!(
                    "WAL segment {} corrupt at offset {}; truncating and discarding later segments",
                    path.display(),
                    valid_len
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| KvError::Wal(format!("open {}: {}", path.display(), e)))?;
                file.set_len(valid_len)
                    .map_err(|e| KvError::Wal(format!("truncate {}: {}", path.display(), e)))?;
                for &later in &segments[idx + 1..] {
                    let later_path = segment_path(dir, later);
                    std::fs::remove_file(&later_path).map_err(|e| {
                        KvError::Wal(format!("remove {}: {}", later_path.display(), e))
                    })?;
                }
                tail = Some((seg_no, valid_len));
                break;
            }
            tail = Some((seg_no, valid_len));
        }

        let (segment_no, segment_len) = tail.unwrap_or((0, 0));
        let path = segment_path(dir, segment_no);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvError::Wal(format!("open {}: {}", path.display(), e)))?;

        let wal = Self {
            dir: dir.to_path_buf(),
            segment_size,
            appender: Mutex::new(Appender {
                file,
                segment_no,
                segment_len,
                last_lsn,
            }),
            meta_lock: Mutex::new(()),
            committed: AtomicU64::new(committed),
        };
        Ok((wal, pending))
    }

    /// Append one redo record, fsync it, and return its LSN. Appends are
    /// serialized internally; LSN order equals file order.
    pub fn append(&self, db: &str, ops: &[(Vec<u8>, Vec<u8>)]) -> Result<Lsn> {
        let mut appender = self.appender.lock();
        let lsn = appender.last_lsn + 1;

        let entry = WalEntry {
            lsn,
            db: db.to_string(),
            ops: ops.to_vec(),
        };
        let body = bincode::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|e| KvError::Wal(format!("encode entry: {}", e)))?;

        let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());

        if appender.segment_len > 0
            && appender.segment_len + frame.len() as u64 > self.segment_size
        {
            let next = appender.segment_no + 1;
            let path = segment_path(&self.dir, next);
            appender.file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .map_err(|e| KvError::Wal(format!("roll to {}: {}", path.display(), e)))?;
            appender.segment_no = next;
            appender.segment_len = 0;
            tracing::info!("rolled WAL to segment {}", path.display());
        }

        appender
            .file
            .write_all(&frame)
            .map_err(|e| KvError::Wal(format!("append lsn {}: {}", lsn, e)))?;
        appender
            .file
            .sync_data()
            .map_err(|e| KvError::Wal(format!("fsync lsn {}: {}", lsn, e)))?;

        appender.segment_len += frame.len() as u64;
        appender.last_lsn = lsn;
        Ok(lsn)
    }

    /// Advance the durable checkpoint to `lsn`. Meta is rewritten atomically
    /// (temp file + rename + parent fsync) and never moves backwards.
    pub fn update_meta(&self, lsn: Lsn) -> Result<()> {
        let _guard = self.meta_lock.lock();
        if lsn <= self.committed.load(Ordering::Acquire) {
            return Ok(());
        }

        let tmp = self.dir.join(META_TMP_FILE);
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&lsn.to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(&lsn.to_be_bytes()).to_be_bytes());

        let mut file = File::create(&tmp)
            .map_err(|e| KvError::Wal(format!("create {}: {}", tmp.display(), e)))?;
        file.write_all(&buf)
            .map_err(|e| KvError::Wal(format!("write meta: {}", e)))?;
        file.sync_data()
            .map_err(|e| KvError::Wal(format!("fsync meta: {}", e)))?;
        drop(file);

        let meta = self.dir.join(META_FILE);
        std::fs::rename(&tmp, &meta)
            .map_err(|e| KvError::Wal(format!("rename meta: {}", e)))?;
        File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| KvError::Wal(format!("fsync {}: {}", self.dir.display(), e)))?;

        self.committed.store(lsn, Ordering::Release);
        Ok(())
    }

    pub fn committed_lsn(&self) -> Lsn {
        self.committed.load(Ordering::Acquire)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.appender.lock().last_lsn
    }
}

/// Re-apply `pending` (the post-meta tail) through the named stores, then
/// advance meta past the last applied entry. An entry naming a database
/// that no longer exists is a fatal recovery error.
pub fn replay(
    wal: &Wal,
    pending: Vec<WalEntry>,
    stores: &HashMap<String, Arc<PartitionedStore>>,
) -> Result<usize> {
    let count = pending.len();
    let mut last = None;
    for entry in pending {
        let store = stores.get(&entry.db).ok_or_else(|| {
            KvError::Wal(format!(
                "entry {} names unknown database '{}'",
                entry.lsn, entry.db
            ))
        })?;
        store.write(&WriteBatch::from_unique(entry.ops))?;
        last = Some(entry.lsn);
    }
    if let Some(lsn) = last {
        wal.update_meta(lsn)?;
        tracing::info!("replayed {} WAL entr(ies) up to lsn {}", count, lsn);
    }
    Ok(count)
}

fn segment_path(dir: &Path, no: u32) -> PathBuf {
    dir.join(format!("wal.{:03}", no))
}

fn list_segments(dir: &Path) -> Result<Vec<u32>> {
    let mut segments = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| KvError::Wal(format!("read {}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| KvError::Wal(e.to_string()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(no) = name.strip_prefix("wal.") {
            if let Ok(no) = no.parse::<u32>() {
                segments.push(no);
            }
        }
    }
    Ok(segments)
}

/// Decode every sound record of one segment. Returns the entries, the byte
/// offset of the first unsound record, and whether the segment ends cleanly.
fn scan_segment(data: &[u8]) -> (Vec<WalEntry>, u64, bool) {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    loop {
        if data.len() == offset {
            return (entries, offset as u64, true);
        }
        if data.len() - offset < 4 {
            return (entries, offset as u64, false);
        }
        let body_len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let Some(frame_end) = (offset + 4)
            .checked_add(body_len)
            .and_then(|e| e.checked_add(4))
        else {
            return (entries, offset as u64, false);
        };
        if frame_end > data.len() {
            return (entries, offset as u64, false);
        }

        let body = &data[offset + 4..offset + 4 + body_len];
        let crc = u32::from_be_bytes(data[frame_end - 4..frame_end].try_into().unwrap());
        if crc32fast::hash(body) != crc {
            return (entries, offset as u64, false);
        }
        match bincode::decode_from_slice::<WalEntry, _>(body, bincode::config::standard()) {
            Ok((entry, _)) => entries.push(entry),
            Err(_) => return (entries, offset as u64, false),
        }
        offset = frame_end;
    }
}

fn read_meta(path: &Path) -> Result<Lsn> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(KvError::Wal(format!("read {}: {}", path.display(), e))),
    };
    if data.len() != 12 {
        return Err(KvError::Wal(format!(
            "{} is {} bytes, expected 12",
            path.display(),
            data.len()
        )));
    }
    let lsn = u64::from_be_bytes(data[..8].try_into().unwrap());
    let crc = u32::from_be_bytes(data[8..].try_into().unwrap());
    if crc32fast::hash(&data[..8]) != crc {
        return Err(KvError::Wal(format!("{} checksum mismatch", path.display())));
    }
    Ok(lsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pairs(n: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| (format!("k{}", i).into_bytes(), vec![i as u8]))
            .collect()
    }

    #[test]
    fn append_assigns_monotonic_lsns() {
        let dir = tempdir().unwrap();
        let (wal, pending) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        assert!(pending.is_empty());

        let a = wal.append("t", &pairs(2)).unwrap();
        let b = wal.append("t", &pairs(1)).unwrap();
        let c = wal.append("u", &pairs(3)).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(wal.last_lsn(), 3);
        assert_eq!(wal.committed_lsn(), 0);
    }

    #[test]
    fn meta_round_trips_and_never_regresses() {
        let dir = tempdir().unwrap();
        let (wal, _) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        wal.append("t", &pairs(1)).unwrap();
        wal.append("t", &pairs(1)).unwrap();

        wal.update_meta(2).unwrap();
        assert_eq!(wal.committed_lsn(), 2);
        wal.update_meta(1).unwrap();
        assert_eq!(wal.committed_lsn(), 2);

        drop(wal);
        let (wal, pending) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(wal.committed_lsn(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn reopen_surfaces_only_the_post_meta_tail() {
        let dir = tempdir().unwrap();
        let (wal, _) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        wal.append("t", &pairs(1)).unwrap();
        wal.append("t", &pairs(2)).unwrap();
        wal.append("t", &pairs(3)).unwrap();
        wal.update_meta(1).unwrap();
        drop(wal);

        let (wal, pending) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].lsn, 2);
        assert_eq!(pending[1].lsn, 3);
        // New appends continue after the recovered tail.
        assert_eq!(wal.append("t", &pairs(1)).unwrap(), 4);
    }

    #[test]
    fn corrupt_record_truncates_the_log() {
        let dir = tempdir().unwrap();
        let (wal, _) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        wal.append("t", &pairs(1)).unwrap();
        wal.append("t", &pairs(1)).unwrap();
        drop(wal);

        let seg = dir.path().join("wal.000");
        let mut data = std::fs::read(&seg).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&seg, &data).unwrap();

        let (wal, pending) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lsn, 1);
        // The torn entry is gone; its LSN is reused by the next append.
        assert_eq!(wal.append("t", &pairs(1)).unwrap(), 2);
    }

    #[test]
    fn segments_roll_and_recover_across_files() {
        let dir = tempdir().unwrap();
        // Tiny segment limit so every entry rolls.
        let (wal, _) = Wal::open(dir.path(), 64).unwrap();
        for _ in 0..4 {
            wal.append("t", &pairs(2)).unwrap();
        }
        drop(wal);

        let segments = list_segments(dir.path()).unwrap();
        assert!(segments.len() > 1, "expected rolled segments");

        let (_, pending) = Wal::open(dir.path(), 64).unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending.last().unwrap().lsn, 4);
    }

    #[test]
    fn replay_applies_tail_and_advances_meta() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("store");
        let wal_dir = dir.path().join("wal");

        let store = Arc::new(PartitionedStore::open("t", &store_dir, 2).unwrap());
        let (wal, _) = Wal::open(&wal_dir, DEFAULT_SEGMENT_SIZE).unwrap();

        // Simulate a crash after the WAL fsync but before the engine commit:
        // the entry exists in the log while the store stays empty.
        wal.append("t", &[(b"x".to_vec(), b"1".to_vec())]).unwrap();
        drop(wal);

        let (wal, pending) = Wal::open(&wal_dir, DEFAULT_SEGMENT_SIZE).unwrap();
        let mut stores = HashMap::new();
        stores.insert("t".to_string(), Arc::clone(&store));
        assert_eq!(replay(&wal, pending, &stores).unwrap(), 1);

        assert_eq!(store.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(wal.committed_lsn(), 1);

        // Idempotence: a second recovery pass sees nothing to do.
        drop(wal);
        let (wal, pending) = Wal::open(&wal_dir, DEFAULT_SEGMENT_SIZE).unwrap();
        assert!(pending.is_empty());
        assert_eq!(wal.committed_lsn(), 1);
    }

    #[test]
    fn replay_for_unknown_database_is_fatal() {
        let dir = tempdir().unwrap();
        let (wal, _) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        wal.append("ghost", &[(b"x".to_vec(), b"1".to_vec())]).unwrap();
        drop(wal);

        let (wal, pending) = Wal::open(dir.path(), DEFAULT_SEGMENT_SIZE).unwrap();
        let stores = HashMap::new();
        assert!(matches!(
            replay(&wal, pending, &stores),
            Err(KvError::Wal(_))
        ));
    }
}
