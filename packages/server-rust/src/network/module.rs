//! Server lifecycle with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the enabled listeners and
//! reports their addresses, and `serve()` runs both transports until the
//! shutdown future resolves. Binding before serving lets callers learn
//! OS-assigned ports (and register them with discovery) before traffic flows.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::datagram::serve_datagram;
use super::shutdown::ShutdownController;
use super::stream::serve_stream;
use crate::service::ServerPipeline;

/// Addresses actually bound by [`RpcServer::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub stream: Option<SocketAddr>,
    pub datagram: Option<SocketAddr>,
}

/// Both transport listeners of one node, fed by one pipeline.
pub struct RpcServer {
    config: NetworkConfig,
    pipeline: ServerPipeline,
    stream_listener: Option<TcpListener>,
    datagram_socket: Option<UdpSocket>,
    started: bool,
    shutdown: Arc<ShutdownController>,
}

impl RpcServer {
    #[must_use]
    pub fn new(config: NetworkConfig, pipeline: ServerPipeline) -> Self {
        Self {
            config,
            pipeline,
            stream_listener: None,
            datagram_socket: None,
            started: false,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Shared controller, for health checks or triggering shutdown from
    /// elsewhere.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds every enabled listener.
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<BoundAddrs> {
        let mut bound = BoundAddrs::default();
        let host = self.config.host.as_str();

        if self.config.stream.enabled {
            let addr = format!("{host}:{}", self.config.stream.port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding stream listener on {addr}"))?;
            bound.stream = Some(listener.local_addr()?);
            self.stream_listener = Some(listener);
        }
        if self.config.datagram.enabled {
            let addr = format!("{host}:{}", self.config.datagram.port);
            let socket = UdpSocket::bind(&addr)
                .await
                .with_context(|| format!("binding datagram socket on {addr}"))?;
            bound.datagram = Some(socket.local_addr()?);
            self.datagram_socket = Some(socket);
        }

        info!(stream = ?bound.stream, datagram = ?bound.datagram, "listeners bound");
        self.started = true;
        Ok(bound)
    }

    /// Serves until `signal` resolves, then stops accepting and waits up to
    /// `drain_timeout` for in-flight calls.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(self, signal: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!("start() must be called before serve()");
        }
        let shutdown = self.shutdown;
        let mut listeners = JoinSet::new();

        if let Some(listener) = self.stream_listener {
            listeners.spawn(serve_stream(
                listener,
                self.pipeline.clone(),
                self.config.stream.clone(),
                Arc::clone(&shutdown),
            ));
        }
        if let Some(socket) = self.datagram_socket {
            listeners.spawn(serve_datagram(
                socket,
                self.pipeline.clone(),
                self.config.datagram.clone(),
                Arc::clone(&shutdown),
            ));
        }

        shutdown.set_ready();
        tokio::select! {
            () = signal => info!("shutdown signal received"),
            () = shutdown.triggered() => info!("shutdown triggered"),
        }
        shutdown.trigger_shutdown();

        while let Some(joined) = listeners.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "listener task ended abnormally");
            }
        }

        if shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight calls drained");
        } else {
            warn!(
                remaining = shutdown.in_flight_count(),
                "drain timeout expired with calls in flight"
            );
        }
        Ok(())
    }
}
