// Static cluster topology and the readiness handshake.
//
// The descriptor maps each database to its peer URLs and is immutable at
// runtime. A database with more than one peer is clustered; on boot every
// clustered database's peers are probed with CLUSTER_INFO until each one
// confirms the identical peer list. Only then does the service surface
// admit commands beyond CLUSTER_INFO. The handshake confirms the shape of
// the cluster; it replicates no data.

pub mod probe;

use crate::config;
use crate::context::ServerContext;
use crate::error::{KvError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterDescriptor {
    map: BTreeMap<String, Vec<String>>,
}

impl ClusterDescriptor {
    pub fn new(map: BTreeMap<String, Vec<String>>) -> Self {
        Self { map }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(config::load_cluster_map(path)?))
    }

    pub fn peers(&self, db: &str) -> Option<&[String]> {
        self.map.get(db).map(|v| v.as_slice())
    }

    /// Databases whose peer list names more than one node.
    pub fn clustered(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.map.iter().filter(|(_, peers)| peers.len() > 1)
    }

    pub fn has_clustered_dbs(&self) -> bool {
        self.clustered().next().is_some()
    }

    /// Whether a peer's descriptor agrees with ours for `db`: same peers as
    /// an order-insensitive multiset, duplicates rejected.
    pub fn confirms(&self, db: &str, expected: &[String]) -> bool {
        let Some(peers) = self.peers(db) else {
            return false;
        };
        let mut ours = peers.to_vec();
        ours.sort();
        if ours.windows(2).any(|w| w[0] == w[1]) {
            return false;
        }
        let mut theirs = expected.to_vec();
        theirs.sort();
        ours == theirs
    }

    /// Wire form served by CLUSTER_INFO: `db_count u32 BE`, then per
    /// database a length-prefixed name, a peer count, and length-prefixed
    /// URLs. Only clustered databases are listed.
    pub fn encode_wire(&self) -> Vec<u8> {
        let clustered: Vec<_> = self.clustered().collect();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(clustered.len() as u32).to_be_bytes());
        for (db, peers) in clustered {
            buf.extend_from_slice(&(db.len() as u32).to_be_bytes());
            buf.extend_from_slice(db.as_bytes());
            buf.extend_from_slice(&(peers.len() as u32).to_be_bytes());
            for peer in peers {
                buf.extend_from_slice(&(peer.len() as u32).to_be_bytes());
                buf.extend_from_slice(peer.as_bytes());
            }
        }
        buf
    }

    pub fn decode_wire(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let db_count = take_u32(data, &mut pos)?;
        let mut map = BTreeMap::new();
        for _ in 0..db_count {
            let db = take_string(data, &mut pos)?;
            let peer_count = take_u32(data, &mut pos)?;
            let mut peers = Vec::with_capacity(peer_count.min(1024) as usize);
            for _ in 0..peer_count {
                peers.push(take_string(data, &mut pos)?);
            }
            map.insert(db, peers);
        }
        if pos != data.len() {
            return Err(KvError::Wire("trailing bytes in cluster descriptor".into()));
        }
        Ok(Self::new(map))
    }
}

fn take_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| KvError::Wire("truncated cluster descriptor".into()))?;
    let value = u32::from_be_bytes(data[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(value)
}

fn take_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let len = take_u32(data, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| KvError::Wire("truncated cluster descriptor".into()))?;
    let value = String::from_utf8(data[*pos..end].to_vec())
        .map_err(|_| KvError::Wire("cluster descriptor is not UTF-8".into()))?;
    *pos = end;
    Ok(value)
}

/// Probe every peer of every clustered database until each confirms the
/// topology, then open the readiness gate. Unreachable peers retry with
/// exponential backoff indefinitely; a reachable peer answering with a
/// different descriptor is fatal.
pub async fn run_handshake(ctx: &Arc<ServerContext>) -> Result<()> {
    let descriptor = ctx.cluster_descriptor().clone();
    let self_url = ctx.config().advertise_url();

    for (db, peers) in descriptor.clustered() {
        for peer in peers {
            if *peer == self_url {
                continue;
            }
            let mut backoff = BACKOFF_BASE;
            loop {
                match probe::fetch_cluster_info(peer).await {
                    Ok(remote) => {
                        if remote.confirms(db, peers) {
                            tracing::info!("peer {} confirms '{}'", peer, db);
                            break;
                        }
                        return Err(KvError::ClusterMismatch(format!(
                            "peer {} disagrees on the peer list for '{}'",
                            peer, db
                        )));
                    }
                    Err(e) => {
                        tracing::warn!(
                            "peer {} unreachable ({}); retrying in {:?}",
                            peer,
                            e,
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        }
    }

    ctx.set_ready();
    tracing::info!("cluster handshake complete; service surface open");
    Ok(())
}
