// Configuration loading
//
// All configuration is read from flat key=value files: `kvdb.conf` for the
// server itself, `system/dblist` for the database registry, and
// `cluster.conf` for the static peer topology. `#` starts a comment, blank
// lines are ignored, the last occurrence of a duplicated key wins.

use crate::error::{KvError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVICE_PORT: u16 = 7078;
pub const DEFAULT_MANAGER_PORT: u16 = 7060;
pub const DEFAULT_PARTITIONS: u16 = 4;

/// Server-level settings from `kvdb.conf`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub manager_port: u16,
    pub dbs_rootdir: PathBuf,
    pub dbs_partitions: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SERVICE_PORT,
            manager_port: DEFAULT_MANAGER_PORT,
            dbs_rootdir: PathBuf::from("./dbs"),
            dbs_partitions: DEFAULT_PARTITIONS,
        }
    }
}

impl ServerConfig {
    /// Load `kvdb.conf`. A missing file yields the defaults; a present but
    /// malformed file is a CONFIG error.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        if !path.exists() {
            tracing::warn!("{} not found, using defaults", path.display());
            return Ok(config);
        }

        for (key, value) in parse_kv_file(path)? {
            match key.as_str() {
                "host" => config.host = value,
                "port" => config.port = parse_port(&key, &value)?,
                "manager-port" => config.manager_port = parse_port(&key, &value)?,
                "dbs-rootdir" => config.dbs_rootdir = PathBuf::from(value),
                "dbs-partitions" => config.dbs_partitions = parse_partitions(&value)?,
                other => {
                    return Err(KvError::Config(format!("unknown key '{}'", other)));
                }
            }
        }
        Ok(config)
    }

    /// The URL this node advertises to cluster peers.
    pub fn advertise_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-database settings from one `system/dblist` block.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub name: String,
    pub rootdir: Option<PathBuf>,
    pub partitions: Option<u16>,
    pub enable: bool,
}

impl DbConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rootdir: None,
            partitions: None,
            enable: true,
        }
    }

    /// Effective store directory, defaulting under the server root.
    pub fn store_dir(&self, server: &ServerConfig) -> PathBuf {
        self.rootdir
            .clone()
            .unwrap_or_else(|| server.dbs_rootdir.join(&self.name))
    }

    /// Effective partition count, defaulting to the server-wide setting.
    pub fn store_partitions(&self, server: &ServerConfig) -> u16 {
        self.partitions.unwrap_or(server.dbs_partitions)
    }
}

/// The database registry file, `system/dblist`. Keys are
/// `db.<name>.rootdir`, `db.<name>.partitions` and `db.<name>.enable`.
#[derive(Debug, Clone, Default)]
pub struct DbList {
    pub dbs: BTreeMap<String, DbConfig>,
}

impl DbList {
    pub fn load(path: &Path) -> Result<Self> {
        let mut list = Self::default();
        if !path.exists() {
            return Ok(list);
        }

        for (key, value) in parse_kv_file(path)? {
            let rest = key
                .strip_prefix("db.")
                .ok_or_else(|| KvError::Config(format!("unknown key '{}'", key)))?;
            let (name, field) = rest
                .rsplit_once('.')
                .ok_or_else(|| KvError::Config(format!("unknown key '{}'", key)))?;
            if name.is_empty() {
                return Err(KvError::Config(format!("empty database name in '{}'", key)));
            }

            let entry = list
                .dbs
                .entry(name.to_string())
                .or_insert_with(|| DbConfig::new(name));
            match field {
                "rootdir" => entry.rootdir = Some(PathBuf::from(value)),
                "partitions" => entry.partitions = Some(parse_partitions(&value)?),
                "enable" => entry.enable = parse_bool(&key, &value)?,
                other => {
                    return Err(KvError::Config(format!(
                        "unknown field '{}' for database '{}'",
                        other, name
                    )));
                }
            }
        }
        Ok(list)
    }

    /// Rewrite the dblist file. Called when CREATE_DB extends the registry
    /// so that new databases survive a restart.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::from("# RustyKV database registry\n");
        for db in self.dbs.values() {
            if let Some(dir) = &db.rootdir {
                out.push_str(&format!("db.{}.rootdir={}\n", db.name, dir.display()));
            }
            if let Some(parts) = db.partitions {
                out.push_str(&format!("db.{}.partitions={}\n", db.name, parts));
            }
            out.push_str(&format!("db.{}.enable={}\n", db.name, db.enable));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KvError::Config(format!("create {}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, out)
            .map_err(|e| KvError::Config(format!("write {}: {}", path.display(), e)))
    }
}

/// Static peer topology from `cluster.conf`: lines `<db>.<index>=host:port`,
/// indexes contiguous from 0. A database with more than one peer is
/// clustered.
pub fn load_cluster_map(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let mut indexed: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    for (key, value) in parse_kv_file(path)? {
        let (db, index) = key
            .rsplit_once('.')
            .ok_or_else(|| KvError::Config(format!("unknown key '{}'", key)))?;
        let index: u32 = index
            .parse()
            .map_err(|_| KvError::Config(format!("bad peer index in '{}'", key)))?;
        if db.is_empty() {
            return Err(KvError::Config(format!("empty database name in '{}'", key)));
        }
        if !value.contains(':') {
            return Err(KvError::Config(format!(
                "peer '{}' is not host:port",
                value
            )));
        }
        indexed.entry(db.to_string()).or_default().push((index, value));
    }

    let mut map = BTreeMap::new();
    for (db, mut peers) in indexed {
        peers.sort_by_key(|(i, _)| *i);
        for (expected, (index, _)) in peers.iter().enumerate() {
            if *index as usize != expected {
                return Err(KvError::Config(format!(
                    "peer indexes for '{}' are not contiguous from 0",
                    db
                )));
            }
        }
        let urls: Vec<String> = peers.into_iter().map(|(_, url)| url).collect();
        let mut sorted = urls.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != urls.len() {
            return Err(KvError::Config(format!("duplicate peer URL for '{}'", db)));
        }
        map.insert(db, urls);
    }
    Ok(map)
}

/// Shared line parser for the flat key=value format.
fn parse_kv_file(path: &Path) -> Result<Vec<(String, String)>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| KvError::Config(format!("read {}: {}", path.display(), e)))?;

    let mut pairs = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            KvError::Config(format!("{}:{}: missing '='", path.display(), lineno + 1))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(KvError::Config(format!(
                "{}:{}: empty key",
                path.display(),
                lineno + 1
            )));
        }
        pairs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| KvError::Config(format!("bad port '{}' for '{}'", value, key)))
}

fn parse_partitions(value: &str) -> Result<u16> {
    let n: u16 = value
        .parse()
        .map_err(|_| KvError::Config(format!("bad partition count '{}'", value)))?;
    if n == 0 {
        return Err(KvError::Config("partition count must be at least 1".into()));
    }
    Ok(n)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(KvError::Config(format!(
            "bad boolean '{}' for '{}'",
            other, key
        ))),
    }
}
