//! TCP listener that gives every accepted connection its own subprocess.
//!
//! # Thread Safety
//!
//! The accept loop runs in one spawned task and each connection in another.
//! Connections share nothing but the immutable [`ServerOptions`] and the
//! shutdown token, so a misbehaving client or subprocess only ever takes
//! down its own bridge.

use super::connection::ConnectionBridge;
use crate::config::ServerOptions;
use crate::{Result, TetherError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Handle to a running bridge server. Dropping it shuts the server down.
pub struct BridgeServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    active_connections: Arc<AtomicUsize>,
    task_handle: Option<JoinHandle<()>>,
}

impl BridgeServerHandle {
    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every active bridge.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the accept loop and all connection tasks have finished.
    ///
    /// Only returns after [`shutdown`](Self::shutdown) was requested.
    pub async fn wait(mut self) {
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Bridge server task failed: {}", e);
            }
        }
    }
}

impl Drop for BridgeServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Listening side of the bridge.
pub struct BridgeServer;

impl BridgeServer {
    /// Bind to `options.host:options.port` and start accepting in the
    /// background. Port 0 picks a free port; see [`BridgeServerHandle::addr`].
    pub async fn bind(options: ServerOptions) -> Result<BridgeServerHandle> {
        if options.command.is_empty() {
            return Err(TetherError::Spawn {
                command: String::new(),
                message: "no subprocess command given".to_string(),
            });
        }

        let bind_addr = format!("{}:{}", options.host, options.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TetherError::InvalidAddress {
                addr: bind_addr.clone(),
                message: e.to_string(),
            })?;
        let addr = listener.local_addr()?;

        info!("TCP proxy server listening on {}", addr);
        info!("Will spawn `{}` for each connection", options.command.join(" "));

        let shutdown = CancellationToken::new();
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::new(options),
            shutdown.clone(),
            active_connections.clone(),
        ));

        Ok(BridgeServerHandle {
            addr,
            shutdown,
            active_connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        options: Arc<ServerOptions>,
        shutdown: CancellationToken,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Bridge server shutting down");
                    break;
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let options = options.clone();
                            let shutdown = shutdown.clone();
                            let conns = active_connections.clone();

                            connections.spawn(async move {
                                Self::handle_connection(stream, peer_addr, options, shutdown).await;
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        // Every bridge observes the same token and tears down its subprocess
        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                error!("Connection task failed during shutdown: {}", e);
            }
        }
        info!("Bridge server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        options: Arc<ServerOptions>,
        shutdown: CancellationToken,
    ) {
        let bridge = ConnectionBridge::new(options);
        let span = info_span!("connection", peer = %peer_addr, id = %bridge.id());

        async move {
            info!("New connection from {}", peer_addr);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }
            let (reader, writer) = stream.into_split();

            match bridge.run(reader, writer, shutdown).await {
                Ok(outcome) => info!("Connection from {} closed ({})", peer_addr, outcome),
                Err(e) => warn!("Connection from {} failed: {}", peer_addr, e),
            }
        }
        .instrument(span)
        .await
    }
}
