// Cluster introspection. CLUSTER_INFO is the one command admitted on the
// service surface before the handshake completes; peers use it to confirm
// the shared topology.

use crate::context::ServerContext;
use crate::error::Result;
use crate::executor::{expect_params, CommandExecutor};
use crate::network::message::Command;
use crate::session::Session;
use async_trait::async_trait;

/// `CLUSTER_INFO` — the serialized per-database peer lists, clustered
/// databases only.
pub struct ClusterInfo;

#[async_trait]
impl CommandExecutor for ClusterInfo {
    async fn execute(
        &self,
        ctx: &ServerContext,
        _session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 0)?;
        Ok(vec![Some(ctx.cluster_descriptor().encode_wire())])
    }
}
