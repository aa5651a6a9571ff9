//! Pipeline composition: combines all middleware layers into a single service stack.

use std::future::Future;
use std::sync::Arc;

use meshrpc_core::{ErrorCodePrefix, Request, Response, RpcError};
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};

use super::load_shed::LoadShedLayer;
use super::logging::LoggingLayer;
use super::metrics::MetricsLayer;
use super::recovery::RecoveryLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::ServerConfig;
use crate::service::context::{CallContext, RpcCall};
use crate::service::router::Router;

type BoxedPipeline = BoxCloneService<RpcCall, Response, RpcError>;

/// Build the call pipeline by wrapping the `Router` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- counts every call, shed ones included
/// 2. `LoggingLayer` -- span with latency and outcome
/// 3. `LoadShedLayer` -- reject when overloaded before doing any work
/// 4. `TimeoutLayer` -- enforce the call deadline
/// 5. `RecoveryLayer` -- turn handler panics into errors (closest to the handler)
#[must_use]
pub fn build_pipeline(router: Arc<Router>, config: &ServerConfig) -> ServerPipeline {
    let service = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(LoggingLayer)
        .layer(LoadShedLayer::new(config.overload_limit_per_sec))
        .layer(TimeoutLayer::new(config.default_call_timeout()))
        .layer(RecoveryLayer)
        .service(router.into_service());

    ServerPipeline {
        service: BoxCloneService::new(service),
        prefix: config.error_code_prefix.clone(),
    }
}

// ---------------------------------------------------------------------------
// ServerPipeline
// ---------------------------------------------------------------------------

/// The composed service stack plus the error rendering used on the wire.
///
/// Cheap to clone; every connection task holds its own copy.
#[derive(Clone)]
pub struct ServerPipeline {
    service: BoxedPipeline,
    prefix: ErrorCodePrefix,
}

impl ServerPipeline {
    #[must_use]
    pub fn error_code_prefix(&self) -> &ErrorCodePrefix {
        &self.prefix
    }

    /// Runs one call through the stack and renders any error as a failure
    /// envelope. The returned future owns everything it needs.
    pub fn handle(
        &self,
        ctx: CallContext,
        request: Request,
    ) -> impl Future<Output = Response> + Send + 'static {
        let service = self.service.clone();
        let prefix = self.prefix.clone();
        async move {
            match service.oneshot(RpcCall::new(ctx, request)).await {
                Ok(response) => response,
                Err(err) => err.into_response(&prefix),
            }
        }
    }
}

impl std::fmt::Debug for ServerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPipeline")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
