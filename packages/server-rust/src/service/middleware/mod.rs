//! Tower middleware wrapped around the router.
//!
//! - [`recovery`]: converts panics into structured errors
//! - [`timeout`]: per-call deadline enforcement
//! - [`load_shed`]: fixed one-second window request limiter
//! - [`logging`]: `tracing` span per call with latency and outcome
//! - [`metrics`]: request counters and latency histograms
//! - [`pipeline`]: composes all layers into a single service stack

pub mod load_shed;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod recovery;
pub mod timeout;

pub use load_shed::{LoadShedLayer, SecondWindow};
pub use logging::LoggingLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_pipeline, ServerPipeline};
pub use recovery::RecoveryLayer;
pub use timeout::TimeoutLayer;

use meshrpc_core::{Response, RpcError};

/// Outcome label shared by logging and metrics.
pub(crate) fn outcome_label(result: &Result<Response, RpcError>) -> &'static str {
    match result {
        Ok(resp) if resp.is_success() => "ok",
        Ok(_) => "remote_error",
        Err(_) => "error",
    }
}
