//! TCP listener for miners.
//!
//! Every accepted connection gets a session from the [`ClientRegistry`], a writer task
//! draining the session's outbound channel and a read loop that answers requests in the
//! order they arrive. Either side ending (socket closed, session cancelled, shutdown)
//! tears down both and deregisters the session.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use super::{messages::JsonRpcRequest, StratumHandler};
use crate::{
    client_registry::ClientRegistry,
    error::PoolResult,
    metrics::{ErrorShortCode, PoolMetrics},
    session::MiningSession,
    status::{send_status, State, Status},
    task_manager::TaskManager,
    utils::{wait_for_shutdown, ShutdownMessage},
};

/// Longest accepted request line.
const MAX_LINE_LENGTH: usize = 16 * 1024;

pub struct StratumServer {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    handler: Arc<StratumHandler>,
    metrics: Arc<PoolMetrics>,
}

impl StratumServer {
    pub async fn bind(
        address: SocketAddr,
        registry: Arc<ClientRegistry>,
        handler: Arc<StratumHandler>,
        metrics: Arc<PoolMetrics>,
    ) -> PoolResult<Self> {
        let listener = TcpListener::bind(address).await?;
        info!("Stratum server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            handler,
            metrics,
        })
    }

    pub fn local_addr(&self) -> PoolResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawns the accept loop on `task_manager`.
    pub fn start(
        self,
        notify_shutdown: broadcast::Sender<ShutdownMessage>,
        status_sender: async_channel::Sender<Status>,
        task_manager: Arc<TaskManager>,
    ) {
        task_manager.spawn(async move {
            let mut shutdown = notify_shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => {
                        info!("Stratum server: received shutdown signal");
                        break;
                    }
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer, &notify_shutdown),
                        Err(e) => {
                            error!("Stratum server failed to accept connection: {e}");
                            send_status(
                                &status_sender,
                                State::StratumServerShutdown(e.to_string()),
                            )
                            .await;
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        notify_shutdown: &broadcast::Sender<ShutdownMessage>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "Failed to set TCP_NODELAY: {e}");
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = self.registry.on_connect(peer, outbound_tx);
        let (reader, writer) = stream.into_split();

        tokio::spawn(write_loop(session.clone(), writer, outbound_rx));

        let registry = self.registry.clone();
        let handler = self.handler.clone();
        let metrics = self.metrics.clone();
        let shutdown = notify_shutdown.subscribe();
        tokio::spawn(async move {
            read_loop(&session, reader, &handler, &metrics, shutdown).await;
            registry.on_disconnect(&session);
        });
    }
}

async fn write_loop(
    session: Arc<MiningSession>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut framed = FramedWrite::new(writer, LinesCodec::new());
    let cancel = session.cancellation();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // flush what was queued before the disconnect
                while let Ok(line) = outbound.try_recv() {
                    if framed.feed(line).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = SinkExt::<String>::flush(&mut framed).await {
                    debug!(client_id = session.id(), "Flush on disconnect failed: {e}");
                }
                break;
            }
            line = outbound.recv() => match line {
                Some(line) => {
                    if let Err(e) = framed.send(line).await {
                        debug!(client_id = session.id(), "Write failed: {e}");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    session.disconnect();
}

async fn read_loop(
    session: &MiningSession,
    reader: tokio::net::tcp::OwnedReadHalf,
    handler: &StratumHandler,
    metrics: &PoolMetrics,
    mut shutdown: broadcast::Receiver<ShutdownMessage>,
) {
    let mut framed = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let cancel = session.cancellation();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wait_for_shutdown(&mut shutdown) => break,
            line = framed.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(client_id = session.id(), "Error reading from miner: {e}");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                metrics.record_worker_error(&session.wallet(), ErrorShortCode::BadDataFromMiner);
                warn!(client_id = session.id(), "Malformed request: {e}");
                continue;
            }
        };
        let response = handler.handle(session, request).await;
        if let Err(e) = session.send(&response) {
            debug!(client_id = session.id(), "Failed to send response: {e}");
            break;
        }
    }
    session.disconnect();
}
