// Handshake probe: a minimal framed client that asks one peer for its
// cluster descriptor.

use crate::cluster::ClusterDescriptor;
use crate::error::{KvError, Result};
use crate::network::frame::FrameCodec;
use crate::network::message::{Command, Content, Message};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `addr`, issue CLUSTER_INFO, and decode the peer's
/// descriptor. Any failure (connect, timeout, wire, error response) is
/// reported to the caller, which decides between retry and fatal.
pub async fn fetch_cluster_info(addr: &str) -> Result<ClusterDescriptor> {
    tokio::time::timeout(PROBE_TIMEOUT, probe(addr))
        .await
        .map_err(|_| KvError::Internal(format!("probe of {} timed out", addr)))?
}

async fn probe(addr: &str) -> Result<ClusterDescriptor> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| KvError::Internal(format!("connect {}: {}", addr, e)))?;

    let codec = FrameCodec::default();
    let request = Message::request(0, Command::new("CLUSTER_INFO", Vec::new()));
    let mut out = BytesMut::new();
    codec.encode(&request.encode(), &mut out);
    stream
        .write_all(&out)
        .await
        .map_err(|e| KvError::Internal(format!("send to {}: {}", addr, e)))?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(frame) = codec.decode(&mut buf)? {
            let message = Message::decode(&frame)?;
            let Content::Response(response) = message.content else {
                return Err(KvError::Wire(format!("{} sent a request frame", addr)));
            };
            if !response.is_success() {
                return Err(KvError::Internal(format!(
                    "{} answered: {}",
                    addr, response.message
                )));
            }
            let Some(Some(blob)) = response.result.first() else {
                return Err(KvError::Wire(format!("{} sent an empty descriptor", addr)));
            };
            return ClusterDescriptor::decode_wire(blob);
        }

        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| KvError::Internal(format!("read from {}: {}", addr, e)))?;
        if n == 0 {
            return Err(KvError::Internal(format!(
                "{} closed before answering",
                addr
            )));
        }
    }
}
