//! Client invocation: discovery, endpoint selection, circuit breaking and
//! pooled outbound connections.

pub mod balancer;
pub mod breaker;
pub mod discovery;
pub mod refresher;
pub mod service;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use balancer::{BalancerConfig, BalancerError, BalancerSet, ConnectionBalancer, Connector};
pub use breaker::{BreakerError, BreakerRegistry, CircuitBreaker, CircuitConfig, CircuitState};
pub use discovery::{discovery_fn, CachedDiscovery, Discovery, DiscoveryError, Endpoints, StaticDiscovery};
pub use refresher::{EndpointRefresher, RefreshTask};
pub use service::{CallBuilder, Fallback, Service};
pub use transport::{DatagramTransport, StreamConnector, StreamTransport, Transport, TransportKind};

use crate::network::{DatagramConfig, StreamConfig};
use crate::service::BackgroundWorker;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub stream: StreamConfig,
    pub datagram: DatagramConfig,
    pub balancer: BalancerConfig,
    /// How often the refresher re-polls discovery.
    pub refresh_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            datagram: DatagramConfig::default(),
            balancer: BalancerConfig::default(),
            refresh_interval: Duration::from_secs(5),
        }
    }
}

/// Entry point for outbound calls. Services created from one client share
/// its discovery, transports and breaker registry.
pub struct Client {
    config: ClientConfig,
    discovery: Arc<dyn Discovery>,
    stream: Arc<StreamTransport>,
    datagram: Arc<DatagramTransport>,
    breakers: Arc<BreakerRegistry>,
}

impl Client {
    #[must_use]
    pub fn new(config: ClientConfig, discovery: Arc<dyn Discovery>) -> Self {
        let stream = Arc::new(StreamTransport::new(
            config.stream.clone(),
            config.balancer.clone(),
        ));
        let datagram = Arc::new(DatagramTransport::new(config.datagram.clone()));
        Self {
            config,
            discovery,
            stream,
            datagram,
            breakers: Arc::new(BreakerRegistry::new()),
        }
    }

    /// Handle for `name` over the stream transport.
    #[must_use]
    pub fn service(&self, name: impl Into<String>) -> Service {
        Service::new(
            name,
            Arc::clone(&self.discovery),
            Arc::clone(&self.stream) as Arc<dyn Transport>,
        )
        .with_breakers(Arc::clone(&self.breakers))
    }

    /// Handle for `name` over the datagram transport.
    #[must_use]
    pub fn datagram_service(&self, name: impl Into<String>) -> Service {
        Service::new(
            name,
            Arc::clone(&self.discovery),
            Arc::clone(&self.datagram) as Arc<dyn Transport>,
        )
        .with_breakers(Arc::clone(&self.breakers))
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub fn stream_transport(&self) -> &Arc<StreamTransport> {
        &self.stream
    }

    /// Spawns the endpoint refresher watching `services`. It stops when
    /// `cancel` fires or the returned worker is stopped, closing every
    /// pooled connection on the way out.
    #[must_use]
    pub fn start_refresher<I, S>(
        &self,
        services: I,
        cancel: CancellationToken,
    ) -> BackgroundWorker<EndpointRefresher>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut refresher = EndpointRefresher::new(Arc::clone(&self.discovery), Arc::clone(&self.stream));
        for service in services {
            refresher.watch(service);
        }
        BackgroundWorker::spawn(refresher, self.config.refresh_interval, cancel)
    }
}
