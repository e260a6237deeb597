// Hash-partitioned store.
//
// The key space is split into `partitions` sub-stores by the low bits of a
// stable 32-bit hash of the key, so routing survives restarts. Writes to a
// batch take the write side of every touched partition's index lock (in
// ascending partition order) before any value becomes visible, which keeps
// multi-key batches atomic for readers.

use crate::error::Result;
use crate::storage::engine::{KvStore, WriteBatch};
use crate::storage::logfile::LogFileStore;
use std::path::Path;

pub struct PartitionedStore {
    name: String,
    partitions: Vec<LogFileStore>,
}

impl PartitionedStore {
    pub fn open(name: &str, dir: &Path, partitions: u16) -> Result<Self> {
        assert!(partitions >= 1, "partition count must be at least 1");
        let mut stores = Vec::with_capacity(partitions as usize);
        for i in 0..partitions {
            stores.push(LogFileStore::open(&dir.join(format!("partition-{}", i)))?);
        }
        tracing::debug!(
            "opened store '{}' with {} partition(s) under {}",
            name,
            partitions,
            dir.display()
        );
        Ok(Self {
            name: name.to_string(),
            partitions: stores,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn route(&self, key: &[u8]) -> usize {
        let n = self.partitions.len();
        if n == 1 {
            return 0;
        }
        let hash = crc32fast::hash(key) as usize;
        if n.is_power_of_two() {
            hash & (n - 1)
        } else {
            hash % n
        }
    }

    /// Number of live keys across all partitions. Test and admin surface
    /// only; not consistent with concurrent writers.
    pub fn key_count(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }
}

impl KvStore for PartitionedStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.partitions[self.route(key)].get(key))
    }

    fn write(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Group ops per partition.
        let mut grouped: Vec<Vec<(Vec<u8>, Vec<u8>)>> =
            vec![Vec::new(); self.partitions.len()];
        for (key, value) in batch.ops() {
            grouped[self.route(key)].push((key.clone(), value.clone()));
        }

        // Durability first: the records hit each partition's data log and
        // fsync before any of them becomes visible.
        for (i, ops) in grouped.iter().enumerate() {
            if !ops.is_empty() {
                self.partitions[i].append_durable(ops)?;
            }
        }

        // Visibility second: hold every touched partition's write lock
        // (ascending order) while installing, so readers see all or nothing.
        let mut guards = Vec::new();
        for (i, ops) in grouped.iter().enumerate() {
            if !ops.is_empty() {
                guards.push((self.partitions[i].index().write(), ops));
            }
        }
        for (guard, ops) in guards.iter_mut() {
            for (key, value) in ops.iter() {
                guard.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(pairs: &[(&[u8], &[u8])]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (k, v) in pairs {
            batch.set(k.to_vec(), v.to_vec());
        }
        batch
    }

    #[test]
    fn routing_is_stable_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = PartitionedStore::open("t", dir.path(), 4).unwrap();
            let mut b = WriteBatch::new();
            for i in 0..64u32 {
                b.set(
                    format!("key-{}", i).into_bytes(),
                    i.to_be_bytes().to_vec(),
                );
            }
            store.write(&b).unwrap();
        }

        let store = PartitionedStore::open("t", dir.path(), 4).unwrap();
        for i in 0..64u32 {
            let got = store.get(format!("key-{}", i).as_bytes()).unwrap();
            assert_eq!(got, Some(i.to_be_bytes().to_vec()), "key-{}", i);
        }
        assert_eq!(store.key_count(), 64);
    }

    #[test]
    fn single_partition_short_circuits() {
        let dir = tempdir().unwrap();
        let store = PartitionedStore::open("t", dir.path(), 1).unwrap();
        store.write(&batch(&[(b"a", b"1")])).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(store.contains(b"a").unwrap());
        assert!(!store.contains(b"b").unwrap());
    }

    #[test]
    fn batch_spanning_partitions_lands_whole() {
        let dir = tempdir().unwrap();
        let store = PartitionedStore::open("t", dir.path(), 8).unwrap();

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..32u32)
            .map(|i| (format!("k{}", i).into_bytes(), vec![i as u8]))
            .collect();
        store.write(&WriteBatch::from_unique(pairs.clone())).unwrap();
        for (k, v) in pairs {
            assert_eq!(store.get(&k).unwrap(), Some(v));
        }
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = PartitionedStore::open("t", dir.path(), 2).unwrap();
        store.write(&WriteBatch::new()).unwrap();
        assert_eq!(store.key_count(), 0);
    }
}
