//! Overload shedding ("snow-slide protection").
//!
//! Counts calls in the current wall-clock second and rejects with
//! `OVERLOADED` once the per-second limit is reached. The counter resets
//! when the second changes: a fixed window, not a sliding one.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use meshrpc_core::{Response, RpcError};
use tower::{Layer, Service};

use crate::service::context::RpcCall;

// ---------------------------------------------------------------------------
// SecondWindow
// ---------------------------------------------------------------------------

const COUNT_MASK: u64 = 0xFFFF_FFFF;

/// One-second fixed-window counter.
///
/// The window second (low 32 bits) and the count are packed into one
/// `AtomicU64` so the reset at a second boundary and the increment are a
/// single compare-and-swap.
#[derive(Debug)]
pub struct SecondWindow {
    limit: u32,
    state: AtomicU64,
}

impl SecondWindow {
    /// A `limit` of 0 disables shedding.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Admits one call in the current wall-clock second.
    pub fn try_acquire(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.try_acquire_at(now)
    }

    /// Admits one call in `second` (seconds since the epoch).
    pub fn try_acquire_at(&self, second: u64) -> bool {
        if self.limit == 0 {
            return true;
        }
        let window = second & COUNT_MASK;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let current_window = current >> 32;
            let count = current & COUNT_MASK;
            let next = if current_window == window {
                if count >= u64::from(self.limit) {
                    return false;
                }
                current + 1
            } else {
                (window << 32) | 1
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that rejects calls beyond a per-second limit.
///
/// Rejected calls never reach the inner service; the error is `OVERLOADED`
/// so callers can tell "not run" apart from "ran and failed".
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    window: Arc<SecondWindow>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(limit_per_second: u32) -> Self {
        Self {
            window: Arc::new(SecondWindow::new(limit_per_second)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            window: Arc::clone(&self.window),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    window: Arc<SecondWindow>,
}

impl<S> Service<RpcCall> for LoadShedService<S>
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
        if !self.window.try_acquire() {
            tracing::warn!(
                interface = %call.request.req_interface,
                limit = self.window.limit(),
                "call shed: per-second limit reached"
            );
            return Box::pin(async { Err(RpcError::overloaded()) });
        }
        Box::pin(self.inner.call(call))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
