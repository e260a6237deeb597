// Node bootstrap, shared by the server binary and the integration tests.
//
// Order matters: open every configured store, recover the WAL into them,
// bring the listeners up, and only then start the cluster handshake so
// peers probing us can already reach CLUSTER_INFO.

use crate::cluster::{self, ClusterDescriptor};
use crate::config::{DbList, ServerConfig};
use crate::context::{Database, ServerContext};
use crate::error::Result;
use crate::network::{Server, ServerHandle};
use crate::storage::PartitionedStore;
use crate::wal::{self, Wal, DEFAULT_SEGMENT_SIZE};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub struct Node {
    pub ctx: Arc<ServerContext>,
    pub handle: ServerHandle,
}

/// Boot a node from the configuration directory (`kvdb.conf`,
/// `system/dblist`, `cluster.conf`). The caller maps errors to process
/// exit codes.
pub async fn start_node(conf_dir: &Path) -> Result<Node> {
    let config = ServerConfig::load(&conf_dir.join("kvdb.conf"))?;
    let dblist_path = conf_dir.join("system").join("dblist");
    let dblist = DbList::load(&dblist_path)?;
    let descriptor = ClusterDescriptor::load(&conf_dir.join("cluster.conf"))?;

    // Open every configured store, disabled ones included: WAL recovery
    // must be able to reach them.
    let databases = DashMap::new();
    let mut stores = HashMap::new();
    for db_config in dblist.dbs.values() {
        let store = Arc::new(PartitionedStore::open(
            &db_config.name,
            &db_config.store_dir(&config),
            db_config.store_partitions(&config),
        )?);
        stores.insert(db_config.name.clone(), Arc::clone(&store));
        databases.insert(
            db_config.name.clone(),
            Arc::new(Database::new(
                db_config.name.clone(),
                store,
                db_config.enable,
            )),
        );
        tracing::info!(
            "database '{}' loaded{}",
            db_config.name,
            if db_config.enable { "" } else { " (disabled)" }
        );
    }

    let (wal, pending) = Wal::open(&config.dbs_rootdir.join("wal"), DEFAULT_SEGMENT_SIZE)?;
    let replayed = wal::replay(&wal, pending, &stores)?;
    if replayed > 0 {
        tracing::info!("WAL recovery reapplied {} entr(ies)", replayed);
    }

    let ctx = Arc::new(ServerContext::new(
        config,
        dblist,
        dblist_path,
        databases,
        wal,
        descriptor,
    ));

    let handle = Server::new(Arc::clone(&ctx)).start().await?;

    if ctx.cluster_descriptor().has_clustered_dbs() {
        let handshake_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = cluster::run_handshake(&handshake_ctx).await {
                tracing::error!("{}", e);
                std::process::exit(e.exit_code());
            }
        });
    } else {
        ctx.set_ready();
        tracing::info!("no clustered databases; service surface open");
    }

    Ok(Node { ctx, handle })
}
