//! Request counters and latency histograms via the `metrics` facade.
//!
//! Without an installed recorder the macros are no-ops; the node binary
//! installs a Prometheus exporter.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use meshrpc_core::{Response, RpcError};
use tower::{Layer, Service};

use super::outcome_label;
use crate::service::context::RpcCall;

pub const REQUESTS_TOTAL: &str = "meshrpc_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "meshrpc_request_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<RpcCall> for MetricsService<S>
where
    S: Service<RpcCall, Response = Response, Error = RpcError> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = RpcError;
    type Future = Pin<Box<dyn Future<Output = Result<Response, RpcError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: RpcCall) -> Self::Future {
        let interface = call.request.req_interface.clone();
        let fut = self.inner.call(call);

        Box::pin(async move {
            let start = Instant::now();
            let result = fut.await;
            let outcome = outcome_label(&result);

            metrics::counter!(REQUESTS_TOTAL, "interface" => interface.clone(), "outcome" => outcome)
                .increment(1);
            metrics::histogram!(REQUEST_DURATION_SECONDS, "interface" => interface)
                .record(start.elapsed().as_secs_f64());

            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
