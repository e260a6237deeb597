// Per-connection session state.
//
// A session is created on TCP connect, keyed by the peer's `host:port`. It
// tracks the bound database and the batch buffer; the buffer is private to
// the session until commit, and only the connection's reader task ever
// touches it, so a plain mutex suffices.

use crate::context::Database;
use crate::error::{KvError, Result};
use crate::network::message::Message;
use crate::storage::WriteBatch;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Upper bound on distinct keys buffered by one batch.
pub const MAX_BATCH_SIZE: usize = 10_000_000;

/// Which listener the connection arrived on. Admin commands are only
/// admitted on the manager surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Service,
    Manager,
}

struct State {
    db: Option<Arc<Database>>,
    batching: bool,
    buf: HashMap<Vec<u8>, Vec<u8>>,
}

pub struct Session {
    id: String,
    surface: Surface,
    sink: mpsc::UnboundedSender<Message>,
    state: Mutex<State>,
}

impl Session {
    pub fn new(id: String, surface: Surface, sink: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            surface,
            sink,
            state: Mutex::new(State {
                db: None,
                batching: false,
                buf: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    /// Publish a response. Sending to a closed connection drops silently;
    /// an executor finishing after disconnect must not fail.
    pub fn publish(&self, msg: Message) {
        let _ = self.sink.send(msg);
    }

    /// Bind the session to a database. Any active batch is aborted first.
    pub fn set_db(&self, db: Arc<Database>) {
        let mut state = self.state.lock();
        state.batching = false;
        state.buf.clear();
        state.db = Some(db);
    }

    pub fn bound_db(&self) -> Result<Arc<Database>> {
        self.state
            .lock()
            .db
            .clone()
            .ok_or_else(|| KvError::NoSuchDb("session has no database selected".into()))
    }

    pub fn is_batching(&self) -> bool {
        self.state.lock().batching
    }

    /// Enter batch mode. Idempotent; re-entering clears the buffer.
    pub fn begin_batch(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.db.is_none() {
            return Err(KvError::BatchState(
                "BATCH_BEGIN requires a bound database".into(),
            ));
        }
        state.batching = true;
        state.buf.clear();
        Ok(())
    }

    /// Leave batch mode, discarding the buffer. Idempotent.
    pub fn abort_batch(&self) {
        let mut state = self.state.lock();
        state.batching = false;
        state.buf.clear();
    }

    /// Buffer `pairs` in batch mode, last write wins per key. Fails without
    /// touching the buffer if the result would exceed MAX_BATCH_SIZE.
    pub fn buffer_put(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.batching {
            return Err(KvError::BatchState("session is not batching".into()));
        }

        let mut fresh: HashSet<&[u8]> = HashSet::new();
        for (key, _) in &pairs {
            if !state.buf.contains_key(key) {
                fresh.insert(key.as_slice());
            }
        }
        if state.buf.len() + fresh.len() > MAX_BATCH_SIZE {
            return Err(KvError::BatchTooLarge(MAX_BATCH_SIZE));
        }
        drop(fresh);

        for (key, value) in pairs {
            state.buf.insert(key, value);
        }
        Ok(())
    }

    /// Batch-local read: `Some(value)` when the session buffered a write
    /// for `key`; `None` falls through to the engine.
    pub fn buffered(&self, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.lock();
        if !state.batching {
            return None;
        }
        state.buf.get(key).cloned()
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().buf.len()
    }

    /// Close out the batch for commit. On a size mismatch the session stays
    /// in batch mode with the buffer intact; on success the buffer drains
    /// into the returned batch and the session returns to bound state.
    pub fn take_batch(&self, expected: Option<usize>) -> Result<WriteBatch> {
        let mut state = self.state.lock();
        if !state.batching {
            return Err(KvError::BatchState(
                "BATCH_COMMIT without BATCH_BEGIN".into(),
            ));
        }
        if let Some(expected) = expected {
            if expected != state.buf.len() {
                return Err(KvError::BatchSizeMismatch {
                    expected,
                    actual: state.buf.len(),
                });
            }
        }
        state.batching = false;
        let ops: Vec<(Vec<u8>, Vec<u8>)> = state.buf.drain().collect();
        Ok(WriteBatch::from_unique(ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PartitionedStore;
    use tempfile::tempdir;

    fn session_with_db(dir: &std::path::Path) -> (Session, Arc<Database>) {
        let store = PartitionedStore::open("t", &dir.join("t"), 1).unwrap();
        let db = Arc::new(Database::new("t".to_string(), Arc::new(store), true));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new("10.0.0.1:5000".into(), Surface::Service, tx);
        (session, db)
    }

    #[test]
    fn begin_requires_a_bound_database() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        assert!(matches!(
            session.begin_batch(),
            Err(KvError::BatchState(_))
        ));
        session.set_db(db);
        session.begin_batch().unwrap();
        assert!(session.is_batching());
    }

    #[test]
    fn rebinding_aborts_the_active_batch() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        session.set_db(Arc::clone(&db));
        session.begin_batch().unwrap();
        session
            .buffer_put(vec![(b"k".to_vec(), b"v".to_vec())])
            .unwrap();

        session.set_db(db);
        assert!(!session.is_batching());
        assert_eq!(session.buffered_len(), 0);
    }

    #[test]
    fn begin_is_idempotent_and_clears() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        session.set_db(db);
        session.begin_batch().unwrap();
        session
            .buffer_put(vec![(b"k".to_vec(), b"v".to_vec())])
            .unwrap();
        session.begin_batch().unwrap();
        assert_eq!(session.buffered_len(), 0);
        assert!(session.is_batching());
    }

    #[test]
    fn batch_reads_are_read_your_own_writes() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        session.set_db(db);
        assert_eq!(session.buffered(b"k"), None);

        session.begin_batch().unwrap();
        session
            .buffer_put(vec![
                (b"k".to_vec(), b"v1".to_vec()),
                (b"k".to_vec(), b"v2".to_vec()),
            ])
            .unwrap();
        assert_eq!(session.buffered(b"k"), Some(b"v2".to_vec()));
        assert_eq!(session.buffered_len(), 1);

        session.abort_batch();
        assert_eq!(session.buffered(b"k"), None);
    }

    #[test]
    fn commit_size_mismatch_keeps_the_batch() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        session.set_db(db);
        session.begin_batch().unwrap();
        session
            .buffer_put(vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ])
            .unwrap();

        let err = session.take_batch(Some(1)).unwrap_err();
        assert!(matches!(
            err,
            KvError::BatchSizeMismatch {
                expected: 1,
                actual: 2
            }
        ));
        assert!(session.is_batching());
        assert_eq!(session.buffered_len(), 2);

        let batch = session.take_batch(Some(2)).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(!session.is_batching());
    }

    #[test]
    fn commit_without_begin_is_a_state_error() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        session.set_db(db);
        assert!(matches!(
            session.take_batch(None),
            Err(KvError::BatchState(_))
        ));
    }

    #[test]
    fn put_outside_batch_mode_is_rejected() {
        let dir = tempdir().unwrap();
        let (session, db) = session_with_db(dir.path());
        session.set_db(db);
        assert!(matches!(
            session.buffer_put(vec![(b"k".to_vec(), b"v".to_vec())]),
            Err(KvError::BatchState(_))
        ));
    }
}
