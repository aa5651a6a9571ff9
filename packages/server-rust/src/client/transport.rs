//! Outbound transports used by [`super::Service`].

use async_trait::async_trait;
use meshrpc_core::{codes, Request, Response, RpcError};

use super::balancer::{BalancerConfig, BalancerSet, Connector};
use super::breaker::BreakerError;
use crate::network::{datagram_call, DatagramConfig, StreamConfig, StreamConnection, TransportError};
use crate::service::CallContext;

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// Which wire a transport speaks; decides the client-side error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl TransportKind {
    #[must_use]
    pub fn timeout_code(self) -> &'static str {
        match self {
            Self::Stream => codes::GRPC_TIMEOUT,
            Self::Datagram => codes::UDP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn error_code(self) -> &'static str {
        match self {
            Self::Stream => codes::GRPC_ERROR,
            Self::Datagram => codes::UDP_ERROR,
        }
    }

    #[must_use]
    pub fn translate(self, err: &TransportError) -> RpcError {
        let code = if err.is_timeout() {
            self.timeout_code()
        } else {
            self.error_code()
        };
        RpcError::named(code, err.to_string())
    }

    /// Breaker timeouts map to the timeout code; rejections (open circuit,
    /// saturation) to the generic error code.
    #[must_use]
    pub fn translate_breaker(self, err: &BreakerError) -> RpcError {
        match err {
            BreakerError::Transport(inner) => self.translate(inner),
            other if other.is_timeout() => RpcError::named(self.timeout_code(), other.to_string()),
            other => RpcError::named(self.error_code(), other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Sends one envelope to `endpoint` and returns the remote envelope.
    ///
    /// # Errors
    ///
    /// Connection, timeout, cancellation and codec failures.
    async fn invoke(
        &self,
        ctx: CallContext,
        endpoint: &str,
        request: Request,
    ) -> Result<Response, TransportError>;
}

// ---------------------------------------------------------------------------
// StreamTransport
// ---------------------------------------------------------------------------

/// Opens multiplexed [`StreamConnection`]s for a balancer.
#[derive(Debug, Clone, Default)]
pub struct StreamConnector {
    config: StreamConfig,
}

impl StreamConnector {
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    type Connection = StreamConnection;

    async fn connect(&self, target: &str) -> Result<StreamConnection, TransportError> {
        StreamConnection::connect(target, &self.config).await
    }

    fn is_alive(&self, conn: &StreamConnection) -> bool {
        !conn.is_closed()
    }

    fn close(&self, conn: &StreamConnection) {
        conn.close();
    }
}

/// Stream transport with one connection balancer per endpoint address.
pub struct StreamTransport {
    balancers: BalancerSet<StreamConnector>,
}

impl StreamTransport {
    #[must_use]
    pub fn new(config: StreamConfig, balancer_config: BalancerConfig) -> Self {
        Self {
            balancers: BalancerSet::new(StreamConnector::new(config), balancer_config),
        }
    }

    /// Endpoints that currently have a balancer.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.balancers.targets()
    }

    /// Opens the balancer for `endpoint` ahead of the first call.
    ///
    /// # Errors
    ///
    /// Returns the connect error if the first connection fails.
    pub async fn warm(&self, endpoint: &str) -> Result<(), TransportError> {
        self.balancers.get_or_open(endpoint).await.map(|_| ())
    }

    /// Drops and closes the balancer for `endpoint`, if any.
    pub async fn close_endpoint(&self, endpoint: &str) {
        self.balancers.remove(endpoint).await;
    }

    pub async fn close_all(&self) {
        self.balancers.remove_all().await;
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        endpoint: &str,
        request: Request,
    ) -> Result<Response, TransportError> {
        let balancer = self.balancers.get_or_open(endpoint).await?;
        let conn = balancer.acquire().await?;
        conn.call(&ctx, &request).await
    }
}

// ---------------------------------------------------------------------------
// DatagramTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DatagramTransport {
    config: DatagramConfig,
}

impl DatagramTransport {
    #[must_use]
    pub fn new(config: DatagramConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        endpoint: &str,
        request: Request,
    ) -> Result<Response, TransportError> {
        datagram_call(&ctx, endpoint, &request, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::network::{serve_stream, ShutdownController};
    use crate::service::{build_pipeline, Router, ServerConfig};

    #[test]
    fn codes_follow_transport_kind() {
        let timeout = TransportError::Timeout;
        let closed = TransportError::Closed;
        assert!(TransportKind::Stream.translate(&timeout).has_code(codes::GRPC_TIMEOUT));
        assert!(TransportKind::Stream.translate(&closed).has_code(codes::GRPC_ERROR));
        assert!(TransportKind::Datagram.translate(&timeout).has_code(codes::UDP_TIMEOUT));
        assert!(TransportKind::Datagram.translate(&closed).has_code(codes::UDP_ERROR));
    }

    #[test]
    fn breaker_rejections_and_timeouts_are_distinguished() {
        let kind = TransportKind::Stream;
        assert!(kind.translate_breaker(&BreakerError::Open).has_code(codes::GRPC_ERROR));
        assert!(kind.translate_breaker(&BreakerError::Saturated(4)).has_code(codes::GRPC_ERROR));
        assert!(kind
            .translate_breaker(&BreakerError::Timeout(Duration::from_millis(10)))
            .has_code(codes::GRPC_TIMEOUT));
        assert!(kind
            .translate_breaker(&BreakerError::Transport(TransportError::Cancelled))
            .has_code(codes::GRPC_TIMEOUT));
    }

    async fn spawn_server() -> (String, Arc<ShutdownController>) {
        let router = Router::new();
        router.register("Ping", || async {}).unwrap();
        let pipeline = build_pipeline(Arc::new(router), &ServerConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = Arc::new(ShutdownController::new());
        tokio::spawn(serve_stream(
            listener,
            pipeline,
            StreamConfig::default(),
            Arc::clone(&shutdown),
        ));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn stream_transport_reuses_balancer_per_endpoint() {
        let (addr, shutdown) = spawn_server().await;
        let transport = StreamTransport::new(StreamConfig::default(), BalancerConfig::default());

        for _ in 0..3 {
            let resp = transport
                .invoke(CallContext::new(), &addr, Request::new("node", "Ping"))
                .await
                .unwrap();
            assert!(resp.is_success());
        }
        assert_eq!(transport.endpoints(), vec![addr.clone()]);

        transport.close_endpoint(&addr).await;
        assert!(transport.endpoints().is_empty());

        // A later call opens a fresh balancer.
        transport.warm(&addr).await.unwrap();
        assert_eq!(transport.endpoints().len(), 1);
        transport.close_all().await;
        assert!(transport.endpoints().is_empty());
        shutdown.trigger_shutdown();
    }

    #[tokio::test]
    async fn stream_transport_reports_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = StreamTransport::new(StreamConfig::default(), BalancerConfig::default());
        let err = transport
            .invoke(CallContext::new(), &addr, Request::new("node", "Ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(transport.endpoints().is_empty());
    }
}
