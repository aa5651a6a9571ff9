//! Periodic endpoint refresh for the stream transport.
//!
//! Polls discovery for every watched service, opens balancers for endpoints
//! that appeared and closes balancers for endpoints that no longer belong to
//! any watched service. A failed lookup keeps the previous endpoint set.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::discovery::Discovery;
use super::transport::StreamTransport;
use crate::service::BackgroundRunnable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTask {
    /// Refresh immediately instead of waiting for the next tick.
    RefreshNow,
    /// Adds a service to the watch list and refreshes it.
    Watch(String),
}

pub struct EndpointRefresher {
    discovery: Arc<dyn Discovery>,
    transport: Arc<StreamTransport>,
    known: BTreeMap<String, BTreeSet<String>>,
}

impl EndpointRefresher {
    #[must_use]
    pub fn new(discovery: Arc<dyn Discovery>, transport: Arc<StreamTransport>) -> Self {
        Self {
            discovery,
            transport,
            known: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn watched(&self) -> Vec<String> {
        self.known.keys().cloned().collect()
    }

    pub fn watch(&mut self, service: impl Into<String>) {
        self.known.entry(service.into()).or_default();
    }

    /// One refresh pass over every watched service.
    pub async fn refresh(&mut self) {
        let mut added = BTreeSet::new();
        for (service, known) in &mut self.known {
            let current: BTreeSet<String> = match self.discovery.resolve(service).await {
                Ok(endpoints) => endpoints.addrs.into_iter().collect(),
                Err(err) => {
                    warn!(%service, error = %err, "endpoint refresh failed, keeping previous set");
                    continue;
                }
            };
            if current != *known {
                info!(%service, endpoints = current.len(), "endpoint set changed");
            }
            added.extend(current.difference(known).cloned());
            *known = current;
        }

        let live: HashSet<&String> = self.known.values().flatten().collect();
        for endpoint in self.transport.endpoints() {
            if !live.contains(&endpoint) {
                debug!(%endpoint, "endpoint gone, closing balancer");
                self.transport.close_endpoint(&endpoint).await;
            }
        }
        for endpoint in added {
            if let Err(err) = self.transport.warm(&endpoint).await {
                warn!(%endpoint, error = %err, "could not open connection to new endpoint");
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for EndpointRefresher {
    type Task = RefreshTask;

    async fn run(&mut self, task: RefreshTask) {
        if let RefreshTask::Watch(service) = task {
            self.watch(service);
        }
        self.refresh().await;
    }

    async fn on_tick(&mut self) {
        self.refresh().await;
    }

    async fn shutdown(&mut self) {
        self.transport.close_all().await;
        debug!("endpoint refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::client::balancer::BalancerConfig;
    use crate::client::discovery::{discovery_fn, DiscoveryError, Endpoints};
    use crate::network::{serve_stream, ShutdownController, StreamConfig};
    use crate::service::{build_pipeline, BackgroundWorker, Router, ServerConfig};

    async fn spawn_server(shutdown: &Arc<ShutdownController>) -> String {
        let router = Router::new();
        router.register("Ping", || async {}).unwrap();
        let pipeline = build_pipeline(Arc::new(router), &ServerConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_stream(
            listener,
            pipeline,
            StreamConfig::default(),
            Arc::clone(shutdown),
        ));
        addr
    }

    /// Discovery whose answer the test can swap; `None` means backend failure.
    fn switchable(answer: &Arc<Mutex<Option<Vec<String>>>>) -> Arc<dyn Discovery> {
        let answer = Arc::clone(answer);
        Arc::new(discovery_fn(move |_svc| match answer.lock().clone() {
            Some(addrs) => Ok(Endpoints::from_addrs(addrs)),
            None => Err(DiscoveryError::Backend(anyhow::anyhow!("registry down"))),
        }))
    }

    fn transport() -> Arc<StreamTransport> {
        Arc::new(StreamTransport::new(
            StreamConfig::default(),
            BalancerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn opens_new_and_closes_removed_endpoints() {
        let shutdown = Arc::new(ShutdownController::new());
        let addr = spawn_server(&shutdown).await;
        let answer = Arc::new(Mutex::new(Some(vec![addr.clone()])));
        let transport = transport();
        let mut refresher = EndpointRefresher::new(switchable(&answer), Arc::clone(&transport));

        refresher.run(RefreshTask::Watch("calc".to_string())).await;
        assert_eq!(refresher.watched(), vec!["calc"]);
        assert_eq!(transport.endpoints(), vec![addr.clone()]);

        *answer.lock() = Some(Vec::new());
        refresher.refresh().await;
        assert!(transport.endpoints().is_empty());
        shutdown.trigger_shutdown();
    }

    #[tokio::test]
    async fn failed_lookup_keeps_connections() {
        let shutdown = Arc::new(ShutdownController::new());
        let addr = spawn_server(&shutdown).await;
        let answer = Arc::new(Mutex::new(Some(vec![addr.clone()])));
        let transport = transport();
        let mut refresher = EndpointRefresher::new(switchable(&answer), Arc::clone(&transport));
        refresher.watch("calc");
        refresher.refresh().await;

        *answer.lock() = None;
        refresher.refresh().await;
        assert_eq!(transport.endpoints(), vec![addr]);
        shutdown.trigger_shutdown();
    }

    #[tokio::test]
    async fn worker_closes_everything_on_stop() {
        let shutdown = Arc::new(ShutdownController::new());
        let addr = spawn_server(&shutdown).await;
        let answer = Arc::new(Mutex::new(Some(vec![addr])));
        let transport = transport();
        let refresher = EndpointRefresher::new(switchable(&answer), Arc::clone(&transport));

        let mut worker = BackgroundWorker::spawn(
            refresher,
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        worker.submit(RefreshTask::Watch("calc".to_string())).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.endpoints().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        worker.stop().await;
        assert!(transport.endpoints().is_empty());
        shutdown.trigger_shutdown();
    }
}
