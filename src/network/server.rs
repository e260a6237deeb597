// TCP server: two listeners sharing one wire pipeline.
//
// The service listener is public; the manager listener binds loopback and
// is the only surface that admits admin commands. Each connection gets a
// session keyed by the peer's `host:port`, a reader loop that decodes
// frames and routes commands, and a writer task draining the session's
// response sink. Commands of one connection are processed in receive
// order, so responses come back in request order.

use crate::context::ServerContext;
use crate::error::{KvError, Result};
use crate::network::frame::FrameCodec;
use crate::network::message::Message;
use crate::session::{Session, Surface};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bound on simultaneously served connections across both listeners.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

pub struct Server {
    ctx: Arc<ServerContext>,
}

/// Live listener state. Tests bind port 0 and read the actual addresses
/// from here; `shutdown` tears the accept loops down.
pub struct ServerHandle {
    pub service_addr: SocketAddr,
    pub manager_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Server {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    pub async fn start(&self) -> Result<ServerHandle> {
        let config = self.ctx.config();
        let service = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| KvError::Config(format!("bind service listener: {}", e)))?;
        let manager = TcpListener::bind(("127.0.0.1", config.manager_port))
            .await
            .map_err(|e| KvError::Config(format!("bind manager listener: {}", e)))?;

        let service_addr = service.local_addr().map_err(KvError::Io)?;
        let manager_addr = manager.local_addr().map_err(KvError::Io)?;
        tracing::info!("service listener on {}", service_addr);
        tracing::info!("manager listener on {}", manager_addr);

        let active = Arc::new(AtomicUsize::new(0));
        let tasks = vec![
            tokio::spawn(accept_loop(
                service,
                Surface::Service,
                Arc::clone(&self.ctx),
                Arc::clone(&active),
            )),
            tokio::spawn(accept_loop(
                manager,
                Surface::Manager,
                Arc::clone(&self.ctx),
                active,
            )),
        ];

        Ok(ServerHandle {
            service_addr,
            manager_addr,
            tasks,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    surface: Surface,
    ctx: Arc<ServerContext>,
    active: Arc<AtomicUsize>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                continue;
            }
        };

        let current = active.load(Ordering::Relaxed);
        if current >= MAX_CONCURRENT_CONNECTIONS {
            tracing::warn!(
                "connection limit reached ({}/{}), rejecting {}",
                current,
                MAX_CONCURRENT_CONNECTIONS,
                peer
            );
            continue;
        }
        active.fetch_add(1, Ordering::Relaxed);

        let ctx = Arc::clone(&ctx);
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            handle_connection(socket, peer, surface, ctx).await;
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    surface: Surface,
    ctx: Arc<ServerContext>,
) {
    let source = peer.to_string();
    let (sink, mut responses) = mpsc::unbounded_channel::<Message>();
    let session = Arc::new(Session::new(source.clone(), surface, sink));
    ctx.register_session(Arc::clone(&session));

    let (mut reader, mut writer) = socket.into_split();

    let writer_task = tokio::spawn(async move {
        let codec = FrameCodec::default();
        let mut out = BytesMut::new();
        while let Some(message) = responses.recv().await {
            out.clear();
            codec.encode(&message.encode(), &mut out);
            if writer.write_all(&out).await.is_err() {
                // Peer is gone. Exiting closes the channel, so anything
                // published after this drops silently.
                break;
            }
        }
    });

    let codec = FrameCodec::default();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    'conn: loop {
        loop {
            let frame = match codec.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("closing {}: {}", source, e);
                    break 'conn;
                }
            };
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("closing {}: {}", source, e);
                    break 'conn;
                }
            };
            if let Err(e) = ctx.process_command(&source, message).await {
                tracing::warn!("closing {}: {}", source, e);
                break 'conn;
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("read from {} failed: {}", source, e);
                break;
            }
        }
    }

    ctx.remove_session(&source);
    // Dropping the session drops the last sender; the writer drains
    // whatever was already published and exits.
    drop(session);
    let _ = writer_task.await;
}
