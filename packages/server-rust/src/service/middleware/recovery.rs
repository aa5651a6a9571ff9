//! Panic recovery.
//!
//! Business errors are returned, not panicked; this layer only keeps a
//! genuinely unexpected panic from tearing down the connection task. A panic
//! whose payload is an [`RpcError`] is reported as that error. Any other
//! payload becomes `INTERNAL_ERROR`; the payload text is logged and never
//! sent to the caller.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use meshrpc_core::{Response, RpcError};
use tower::{Layer, Service};

use crate::service::context::RpcCall;

#[derive(Debug, Clone, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S> Service<RpcCall> for RecoveryService<S>
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
        let trace_id = call.ctx.trace_id.clone();
        let inner = &mut self.inner;
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(move || inner.call(call))) {
            Ok(fut) => fut,
            Err(payload) => {
                let err = recover(&interface, &trace_id, payload);
                return Box::pin(async move { Err(err) });
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(recover(&interface, &trace_id, payload)),
            }
        })
    }
}

fn recover(interface: &str, trace_id: &str, payload: Box<dyn Any + Send>) -> RpcError {
    if let Some(err) = payload.downcast_ref::<RpcError>() {
        tracing::warn!(interface, trace_id, error = %err, "handler panicked with structured error");
        return err.clone();
    }
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(interface, trace_id, panic = %detail, "handler panicked");
    RpcError::internal()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use meshrpc_core::{codes, ErrorCodePrefix, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::service::context::CallContext;

    enum Behaviour {
        Answer,
        PanicStructured,
        PanicText,
    }

    struct PanickyService(Behaviour);

    impl Service<RpcCall> for PanickyService {
        type Response = Response;
        type Error = RpcError;
        type Future = Pin<Box<dyn Future<Output = Result<Response, RpcError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _call: RpcCall) -> Self::Future {
            match self.0 {
                Behaviour::Answer => Box::pin(async { Ok(Response::ok(vec![1])) }),
                Behaviour::PanicStructured => Box::pin(async {
                    explode(|| std::panic::panic_any(RpcError::numeric(400, "rejected")))
                }),
                Behaviour::PanicText => {
                    Box::pin(async { explode(|| panic!("index out of bounds: the len is 0")) })
                }
            }
        }
    }

    fn explode(f: impl FnOnce()) -> Result<Response, RpcError> {
        f();
        Ok(Response::empty())
    }

    fn make_call() -> RpcCall {
        RpcCall::new(CallContext::new(), Request::new("svc", "Boom"))
    }

    #[tokio::test]
    async fn passes_through_normal_results() {
        let svc = RecoveryLayer.layer(PanickyService(Behaviour::Answer));
        assert_eq!(svc.oneshot(make_call()).await.unwrap().body, vec![1]);
    }

    #[tokio::test]
    async fn structured_panic_keeps_its_code() {
        let svc = RecoveryLayer.layer(PanickyService(Behaviour::PanicStructured));
        let resp = svc
            .oneshot(make_call())
            .await
            .unwrap_err()
            .into_response(&ErrorCodePrefix::new("SVC"));
        assert!(!resp.result);
        assert_eq!(resp.mcode, "SVC_400");
    }

    #[tokio::test]
    async fn other_panics_become_internal_error() {
        let svc = RecoveryLayer.layer(PanickyService(Behaviour::PanicText));
        let err = svc.oneshot(make_call()).await.unwrap_err();
        assert!(err.has_code(codes::INTERNAL_ERROR));
        assert!(!err.message().contains("index out of bounds"));
    }
}
