//! Server-side call deadline.
//!
//! Uses the deadline already on the call context, or the layer default when
//! the transport supplied none. On expiry the context is cancelled so work
//! spawned from it (outbound calls, proxying) stops too.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use meshrpc_core::{codes, Response, RpcError};
use tower::{Layer, Service};

use crate::service::context::RpcCall;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default_timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_timeout: self.default_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_timeout: Duration,
}

impl<S> Service<RpcCall> for TimeoutService<S>
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

    fn call(&mut self, mut call: RpcCall) -> Self::Future {
        if call.ctx.deadline().is_none() {
            call.ctx = call.ctx.with_timeout(self.default_timeout);
        }
        let ctx = call.ctx.clone();
        let fut = self.inner.call(call);
        Box::pin(async move {
            tokio::select! {
                result = fut => result,
                () = ctx.expired() => {
                    ctx.cancel();
                    Err(RpcError::named(codes::CALL_TIMEOUT, "call deadline exceeded"))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
