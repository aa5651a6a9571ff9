//! Loopback tests: real listeners, real clients.

use std::sync::Arc;
use std::time::Duration;

use meshrpc_core::{codes, ErrorCodePrefix, RpcError, RpcHeader, RpcRequest, RpcResponse};
use meshrpc_server::client::{Client, ClientConfig, StaticDiscovery};
use meshrpc_server::network::{BoundAddrs, NetworkConfig, RpcServer};
use meshrpc_server::service::{build_pipeline, Body, Header, Router, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountHeader {
    account: String,
}
impl RpcHeader for AccountHeader {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}
impl RpcRequest for AddRequest {}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}
impl RpcResponse for AddResponse {}

async fn add(
    Header(header): Header<AccountHeader>,
    Body(req): Body<AddRequest>,
) -> Result<Option<AddResponse>, RpcError> {
    assert_eq!(header.account, "a");
    Ok(Some(AddResponse { sum: req.a + req.b }))
}

async fn explode(Body(req): Body<AddRequest>) -> Result<Option<AddResponse>, RpcError> {
    if req.a < 0 {
        std::panic::panic_any(RpcError::numeric(400, "negative operand"));
    }
    Ok(None)
}

struct Node {
    addrs: BoundAddrs,
    stop: oneshot::Sender<()>,
    running: JoinHandle<anyhow::Result<()>>,
}

impl Node {
    async fn start(router: Router) -> Self {
        let config = ServerConfig {
            error_code_prefix: ErrorCodePrefix::new("SVC"),
            ..ServerConfig::default()
        };
        let network = NetworkConfig {
            host: "127.0.0.1".to_string(),
            drain_timeout: Duration::from_secs(1),
            ..NetworkConfig::default()
        };
        let mut server = RpcServer::new(network, build_pipeline(Arc::new(router), &config));
        let addrs = server.start().await.unwrap();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(server.serve(async move {
            let _ = stop_rx.await;
        }));
        Self {
            addrs,
            stop,
            running,
        }
    }

    fn stream(&self) -> String {
        self.addrs.stream.unwrap().to_string()
    }

    fn datagram(&self) -> String {
        self.addrs.datagram.unwrap().to_string()
    }

    async fn shutdown(self) {
        self.stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn calc_router() -> Router {
    let router = Router::new();
    router.register("Add", add).unwrap();
    router.register("Explode", explode).unwrap();
    router
}

fn client_for(service: &str, endpoint: String) -> Client {
    let discovery = StaticDiscovery::new().with_service(service, [endpoint]);
    Client::new(ClientConfig::default(), Arc::new(discovery))
}

#[tokio::test]
async fn add_over_stream_transport() {
    let node = Node::start(calc_router()).await;
    let client = client_for("calc", node.stream());
    let calc = client.service("calc");

    let resp: AddResponse = calc
        .call("Add")
        .header(&AccountHeader {
            account: "a".to_string(),
        })
        .body(&AddRequest { a: 1, b: 2 })
        .response()
        .await
        .unwrap();
    assert_eq!(resp, AddResponse { sum: 3 });

    let err = calc.call("Unknown").send().await.unwrap_err();
    assert!(err.has_code(codes::METHOD_NOT_FOUND));

    let err = calc
        .call("Explode")
        .body(&AddRequest { a: -1, b: 0 })
        .send()
        .await
        .unwrap_err();
    assert!(err.has_code("SVC_400"));

    client.stream_transport().close_all().await;
    node.shutdown().await;
}

#[tokio::test]
async fn add_over_datagram_transport() {
    let node = Node::start(calc_router()).await;
    let client = client_for("calc", node.datagram());
    let calc = client.datagram_service("calc");

    let resp: AddResponse = calc
        .call("Add")
        .header(&AccountHeader {
            account: "a".to_string(),
        })
        .body(&AddRequest { a: 40, b: 2 })
        .timeout(Duration::from_secs(2))
        .response()
        .await
        .unwrap();
    assert_eq!(resp, AddResponse { sum: 42 });
    node.shutdown().await;
}

#[tokio::test]
async fn proxy_forwards_to_second_node() {
    let backend = Node::start(calc_router()).await;

    let upstream = client_for("calc", backend.stream());
    let gateway_router = Router::new();
    gateway_router
        .root()
        .proxy_service("calc", Arc::new(upstream.service("calc")))
        .unwrap();
    let gateway = Node::start(gateway_router).await;

    let client = client_for("calc", gateway.stream());
    let resp: AddResponse = client
        .service("calc")
        .call("Add")
        .header(&AccountHeader {
            account: "a".to_string(),
        })
        .body(&AddRequest { a: 5, b: 6 })
        .response()
        .await
        .unwrap();
    assert_eq!(resp, AddResponse { sum: 11 });

    // Backend failure codes come back through the gateway unchanged.
    let err = client
        .service("calc")
        .call("Explode")
        .body(&AddRequest { a: -1, b: 0 })
        .send()
        .await
        .unwrap_err();
    assert!(err.has_code("SVC_400"));

    client.stream_transport().close_all().await;
    upstream.stream_transport().close_all().await;
    gateway.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn missing_service_fails_before_any_connection() {
    let client = Client::new(ClientConfig::default(), Arc::new(StaticDiscovery::new()));
    let err = client.service("calc").call("Add").send().await.unwrap_err();
    assert!(err.has_code(codes::DISCOVERY_FAILED));
    assert!(client.stream_transport().endpoints().is_empty());
}
