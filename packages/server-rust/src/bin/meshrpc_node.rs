//! `meshrpc-node`: runs one RPC node with a demo `Add` handler.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use meshrpc_core::{ErrorCodePrefix, RpcError, RpcHeader, RpcRequest, RpcResponse};
use meshrpc_server::client::{Client, ClientConfig, StaticDiscovery};
use meshrpc_server::network::{NetworkConfig, RpcServer};
use meshrpc_server::service::{build_pipeline, Body, Header, Router, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "meshrpc node")]
struct Cli {
    /// Address to bind both listeners on
    #[arg(long, env = "MESHRPC_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Stream (TCP) port, 0 picks a free port
    #[arg(long, env = "MESHRPC_STREAM_PORT", default_value_t = 7000)]
    stream_port: u16,

    /// Datagram (UDP) port, 0 picks a free port
    #[arg(long, env = "MESHRPC_DATAGRAM_PORT", default_value_t = 7001)]
    datagram_port: u16,

    /// Prefix for numeric error codes
    #[arg(long, env = "MESHRPC_PREFIX", default_value = "SVC")]
    prefix: String,

    /// Calls per second before shedding, 0 disables
    #[arg(long, env = "MESHRPC_OVERLOAD_LIMIT", default_value_t = 0)]
    overload_limit: u32,

    /// Service name to forward when no local handler matches
    #[arg(long, requires = "proxy_endpoint")]
    proxy_service: Option<String>,

    /// `host:port` of the node serving `--proxy-service`
    #[arg(long, requires = "proxy_service")]
    proxy_endpoint: Option<String>,

    /// Prometheus scrape address
    #[arg(long, env = "MESHRPC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

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

#[derive(Debug, Default, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}
impl RpcResponse for AddResponse {}

async fn add(
    Header(header): Header<AccountHeader>,
    Body(req): Body<AddRequest>,
) -> Result<AddResponse, RpcError> {
    let sum = req
        .a
        .checked_add(req.b)
        .ok_or_else(|| RpcError::numeric(400, "sum overflows i64"))?;
    info!(account = %header.account, sum, "add");
    Ok(AddResponse { sum })
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("installing prometheus exporter on {addr}"))?;
        info!(%addr, "metrics exporter listening");
    }

    let router = Router::new();
    router.register("Add", add)?;

    let cancel = CancellationToken::new();
    let mut refresher = None;
    if let (Some(service), Some(endpoint)) = (cli.proxy_service, cli.proxy_endpoint) {
        let discovery = StaticDiscovery::new().with_service(service.clone(), [endpoint.clone()]);
        let client = Client::new(ClientConfig::default(), Arc::new(discovery));
        router
            .root()
            .proxy_service(&service, Arc::new(client.service(service.clone())))?;
        refresher = Some(client.start_refresher([service.clone()], cancel.clone()));
        info!(%service, %endpoint, "proxy rule installed");
    }

    let server_config = ServerConfig {
        error_code_prefix: ErrorCodePrefix::new(cli.prefix),
        overload_limit_per_sec: cli.overload_limit,
        ..ServerConfig::default()
    };
    let mut network = NetworkConfig {
        host: cli.host,
        ..NetworkConfig::default()
    };
    network.stream.port = cli.stream_port;
    network.datagram.port = cli.datagram_port;

    let pipeline = build_pipeline(Arc::new(router), &server_config);
    let mut server = RpcServer::new(network, pipeline);
    let bound = server.start().await?;
    info!(stream = ?bound.stream, datagram = ?bound.datagram, "meshrpc-node ready");

    server
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed, shutting down");
            }
        })
        .await?;

    cancel.cancel();
    if let Some(mut worker) = refresher {
        worker.stop().await;
    }
    info!("meshrpc-node stopped");
    Ok(())
}
