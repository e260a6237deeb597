// Server context: the database registry, the session table, and command
// routing. Durable writes funnel through `durable_write`, which holds the
// per-database lock across `wal.append → engine commit → wal.update_meta`
// so WAL order and engine-visible order match per database.

use crate::cluster::ClusterDescriptor;
use crate::config::{DbConfig, DbList, ServerConfig};
use crate::error::{KvError, Result};
use crate::executor::{CommandKind, Registry};
use crate::network::message::{Content, Message, Response};
use crate::session::{Session, Surface};
use crate::storage::{KvStore, PartitionedStore, WriteBatch};
use crate::wal::Wal;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One named database: the partitioned store plus the lock serializing its
/// durable write path and the visibility flag the admin surface toggles.
pub struct Database {
    name: String,
    store: Arc<PartitionedStore>,
    write_lock: Mutex<()>,
    enabled: AtomicBool,
}

impl Database {
    pub fn new(name: String, store: Arc<PartitionedStore>, enabled: bool) -> Self {
        Self {
            name,
            store,
            write_lock: Mutex::new(()),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &PartitionedStore {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

pub struct ServerContext {
    config: ServerConfig,
    databases: DashMap<String, Arc<Database>>,
    sessions: DashMap<String, Arc<Session>>,
    wal: Wal,
    registry: Registry,
    cluster: ClusterDescriptor,
    ready: AtomicBool,
    /// Registry file state, rewritten when CREATE_DB or the enable flags
    /// change it. Also serializes CREATE_DB races.
    dblist: Mutex<DbList>,
    dblist_path: PathBuf,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        dblist: DbList,
        dblist_path: PathBuf,
        databases: DashMap<String, Arc<Database>>,
        wal: Wal,
        cluster: ClusterDescriptor,
    ) -> Self {
        Self {
            config,
            databases,
            sessions: DashMap::new(),
            wal,
            registry: Registry::new(),
            cluster,
            ready: AtomicBool::new(false),
            dblist: Mutex::new(dblist),
            dblist_path,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster_descriptor(&self) -> &ClusterDescriptor {
        &self.cluster
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Session table
    // ------------------------------------------------------------------

    pub fn register_session(&self, session: Arc<Session>) {
        tracing::debug!("session {} connected", session.id());
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn remove_session(&self, source: &str) {
        if self.sessions.remove(source).is_some() {
            tracing::debug!("session {} disconnected", source);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ------------------------------------------------------------------
    // Database registry
    // ------------------------------------------------------------------

    /// Resolve an enabled database for `USE`.
    pub fn lookup_db(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .get(name)
            .filter(|db| db.is_enabled())
            .map(|db| Arc::clone(&db))
            .ok_or_else(|| KvError::NoSuchDb(name.to_string()))
    }

    /// Create a database under the server root and persist it to the
    /// dblist so it survives restart.
    pub fn create_db(&self, name: &str) -> Result<()> {
        validate_db_name(name)?;

        let mut dblist = self.dblist.lock();
        if self.databases.contains_key(name) {
            return Err(KvError::DbExists(name.to_string()));
        }

        let store = PartitionedStore::open(
            name,
            &self.config.dbs_rootdir.join(name),
            self.config.dbs_partitions,
        )?;
        let db = Arc::new(Database::new(name.to_string(), Arc::new(store), true));
        self.databases.insert(name.to_string(), db);

        dblist
            .dbs
            .insert(name.to_string(), DbConfig::new(name));
        dblist.save(&self.dblist_path)?;
        tracing::info!("created database '{}'", name);
        Ok(())
    }

    /// Flip a database's visibility. Sessions already bound keep their
    /// binding; the flag only gates `USE` and `SHOW_DBS`.
    pub fn set_db_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let db = self
            .databases
            .get(name)
            .map(|db| Arc::clone(&db))
            .ok_or_else(|| KvError::NoSuchDb(name.to_string()))?;
        db.set_enabled(enabled);

        let mut dblist = self.dblist.lock();
        dblist
            .dbs
            .entry(name.to_string())
            .or_insert_with(|| DbConfig::new(name))
            .enable = enabled;
        dblist.save(&self.dblist_path)?;
        tracing::info!(
            "database '{}' {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn enabled_dbs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .iter()
            .filter(|entry| entry.value().is_enabled())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Apply `batch` durably to `db`: WAL append, engine commit, meta
    /// advance, all under the database's write lock. A failure after the
    /// append leaves durability unconfirmed, so it aborts the process and
    /// lets recovery replay the tail on restart.
    pub fn durable_write(&self, db: &Database, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = db.write_lock.lock();
        let lsn = match self.wal.append(db.name(), batch.ops()) {
            Ok(lsn) => lsn,
            Err(e) => fatal_write_failure(db.name(), &e),
        };
        if let Err(e) = db.store().write(batch) {
            fatal_write_failure(db.name(), &e);
        }
        if let Err(e) = self.wal.update_meta(lsn) {
            fatal_write_failure(db.name(), &e);
        }
        Ok(())
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    // ------------------------------------------------------------------
    // Command routing
    // ------------------------------------------------------------------

    /// Resolve the session for `source`, run the command, and publish the
    /// response through the session's sink. `Err` here means a wire-level
    /// violation and closes the connection.
    pub async fn process_command(&self, source: &str, msg: Message) -> Result<()> {
        let session = self
            .sessions
            .get(source)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| KvError::Wire(format!("no session for {}", source)))?;

        let command = match msg.content {
            Content::Request(command) => command,
            Content::Response(_) => {
                return Err(KvError::Wire("unexpected response-kind message".into()));
            }
        };

        let response = match self.execute(&session, &command).await {
            Ok(result) => Response::success(result),
            Err(e) => {
                tracing::debug!("session {}: {} failed: {}", source, command.name, e);
                Response::error(&e)
            }
        };
        session.publish(Message::response(msg.id, response));
        Ok(())
    }

    async fn execute(
        &self,
        session: &Session,
        command: &crate::network::message::Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let kind = CommandKind::parse(&command.name)
            .ok_or_else(|| KvError::UnknownCommand(command.name.clone()))?;

        // Until the cluster handshake confirms the topology, the service
        // surface answers nothing but CLUSTER_INFO.
        if session.surface() == Surface::Service {
            if !self.is_ready() && kind != CommandKind::ClusterInfo {
                return Err(KvError::NotReady);
            }
            if kind.is_admin() {
                // The admin surface is not advertised on the public port.
                return Err(KvError::UnknownCommand(command.name.clone()));
            }
        }

        self.registry.dispatch(kind, self, session, command).await
    }
}

fn fatal_write_failure(db: &str, e: &KvError) -> ! {
    tracing::error!(
        "durable write on '{}' failed, aborting so recovery can replay the WAL: {}",
        db,
        e
    );
    std::process::exit(e.exit_code());
}

fn validate_db_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(KvError::ArgInvalid(
            "database name must be 1..=64 characters".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(KvError::ArgInvalid(format!(
            "invalid database name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::DEFAULT_SEGMENT_SIZE;
    use tempfile::tempdir;

    fn test_context(dir: &std::path::Path) -> ServerContext {
        let mut config = ServerConfig::default();
        config.dbs_rootdir = dir.join("dbs");
        let (wal, _) = Wal::open(&dir.join("dbs").join("wal"), DEFAULT_SEGMENT_SIZE).unwrap();
        ServerContext::new(
            config,
            DbList::default(),
            dir.join("system").join("dblist"),
            DashMap::new(),
            wal,
            ClusterDescriptor::default(),
        )
    }

    #[test]
    fn create_then_lookup_then_disable() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());

        ctx.create_db("test1").unwrap();
        assert!(matches!(
            ctx.create_db("test1"),
            Err(KvError::DbExists(_))
        ));
        assert!(ctx.lookup_db("test1").is_ok());
        assert_eq!(ctx.enabled_dbs(), vec!["test1".to_string()]);

        ctx.set_db_enabled("test1", false).unwrap();
        assert!(matches!(
            ctx.lookup_db("test1"),
            Err(KvError::NoSuchDb(_))
        ));
        assert!(ctx.enabled_dbs().is_empty());

        ctx.set_db_enabled("test1", true).unwrap();
        assert!(ctx.lookup_db("test1").is_ok());
    }

    #[test]
    fn created_dbs_persist_to_the_dblist() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        ctx.create_db("orders").unwrap();

        let reread = DbList::load(&dir.path().join("system").join("dblist")).unwrap();
        assert!(reread.dbs.contains_key("orders"));
        assert!(reread.dbs["orders"].enable);
    }

    #[test]
    fn db_names_are_validated() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        assert!(matches!(ctx.create_db(""), Err(KvError::ArgInvalid(_))));
        assert!(matches!(
            ctx.create_db("bad/name"),
            Err(KvError::ArgInvalid(_))
        ));
        assert!(matches!(
            ctx.create_db(&"x".repeat(65)),
            Err(KvError::ArgInvalid(_))
        ));
    }

    #[test]
    fn durable_write_advances_meta() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        ctx.create_db("t").unwrap();
        let db = ctx.lookup_db("t").unwrap();

        let mut batch = WriteBatch::new();
        batch.set(b"k".to_vec(), b"v".to_vec());
        ctx.durable_write(&db, &batch).unwrap();

        assert_eq!(db.store().get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(ctx.wal().committed_lsn(), 1);
        assert_eq!(ctx.wal().last_lsn(), 1);

        // Empty batches neither hit the WAL nor the engine.
        ctx.durable_write(&db, &WriteBatch::new()).unwrap();
        assert_eq!(ctx.wal().last_lsn(), 1);
    }
}
