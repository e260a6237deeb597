use crate::error::Result;
use std::collections::HashMap;

/// An atomically committed set of key→value assignments.
///
/// Duplicate keys collapse to the last write before the batch reaches the
/// engine, so `len()` counts distinct keys.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Vec<u8>)>,
    index: HashMap<Vec<u8>, usize>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from pairs already known to have distinct keys
    /// (e.g. drained from a session batch buffer).
    pub fn from_unique(ops: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let index = ops
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.clone(), i))
            .collect();
        Self { ops, index }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        match self.index.get(&key) {
            Some(&i) => self.ops[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.ops.len());
                self.ops.push((key, value));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.ops
    }
}

/// A named, durable byte key→byte value engine with atomic batched writes.
///
/// Readers of the same store never observe a partially applied batch.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn write(&self, batch: &WriteBatch) -> Result<()>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}
