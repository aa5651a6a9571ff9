//! Per-call `tracing` span with latency and outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use meshrpc_core::{Response, RpcError};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::outcome_label;
use crate::service::context::RpcCall;

// ---------------------------------------------------------------------------
// LoggingLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

// ---------------------------------------------------------------------------
// LoggingService
// ---------------------------------------------------------------------------

/// Opens an `rpc` span around the inner service and logs one line per call.
#[derive(Debug, Clone)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S> Service<RpcCall> for LoggingService<S>
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
        let span = info_span!(
            "rpc",
            service = %call.request.req_service,
            interface = %call.request.req_interface,
            call_id = call.ctx.call_id,
            trace_id = %call.ctx.trace_id,
            peer = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        if let Some(peer) = call.ctx.peer {
            span.record("peer", tracing::field::display(peer));
        }

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = outcome_label(&result);

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                match &result {
                    Err(err) => tracing::info!(duration_ms, outcome, error = %err, "call complete"),
                    Ok(resp) if !resp.is_success() => {
                        tracing::info!(duration_ms, outcome, mcode = %resp.mcode, "call complete");
                    }
                    Ok(_) => tracing::debug!(duration_ms, outcome, "call complete"),
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use meshrpc_core::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::service::context::CallContext;

    struct FixedService(Result<Response, RpcError>);

    impl Service<RpcCall> for FixedService {
        type Response = Response;
        type Error = RpcError;
        type Future = Pin<Box<dyn Future<Output = Result<Response, RpcError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _call: RpcCall) -> Self::Future {
            let result = self.0.clone();
            Box::pin(async move { result })
        }
    }

    fn make_call() -> RpcCall {
        let peer = "127.0.0.1:9000".parse().unwrap();
        RpcCall::new(
            CallContext::new().with_call_id(7).with_peer(peer),
            Request::new("svc", "Add"),
        )
    }

    #[tokio::test]
    async fn passes_success_through() {
        let svc = LoggingLayer.layer(FixedService(Ok(Response::ok(vec![9]))));
        let resp = svc.oneshot(make_call()).await.unwrap();
        assert_eq!(resp.body, vec![9]);
    }

    #[tokio::test]
    async fn passes_errors_through_unchanged() {
        let svc = LoggingLayer.layer(FixedService(Err(RpcError::numeric(404, "missing"))));
        let err = svc.oneshot(make_call()).await.unwrap_err();
        assert_eq!(err.message(), "missing");
    }
}
