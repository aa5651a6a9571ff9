//! Circuit breaker per `(service, interface)` pair.
//!
//! States:
//! - Closed: calls flow; outcomes are recorded in a rolling window
//! - Open: calls fail fast until `sleep_window` has passed
//! - HalfOpen: one probe call decides between Closed and Open
//!
//! Concurrency is capped by an in-flight counter. The per-call timeout
//! cancels the call's context so the transport abandons the attempt.
//! Settings can be swapped at runtime without resetting the state machine.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use meshrpc_core::Response;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::TransportError;
use crate::service::CallContext;

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Per-call budget enforced by the breaker.
    pub timeout: Duration,
    /// Calls allowed in flight at once; further calls are rejected.
    pub max_concurrency: usize,
    /// Error percentage (0-100) within `window` that opens the circuit.
    pub error_percent_threshold: u8,
    /// Minimum calls within `window` before the error rate is judged.
    pub request_volume_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    pub sleep_window: Duration,
    /// Length of the rolling outcome window.
    pub window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_concurrency: 10,
            error_percent_threshold: 50,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(5),
            window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit open")]
    Open,
    #[error("max concurrency of {0} reached")]
    Saturated(usize),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BreakerError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Transport(err) => err.is_timeout(),
            Self::Open | Self::Saturated(_) => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// `(recorded at, failed)` for calls inside the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
}

/// An admitted call. Dropped unsettled, a probe counts as failed so the
/// circuit re-opens instead of waiting on a probe that will never report.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, failed: bool) {
        self.settled = true;
        self.breaker.record(self.probe, failed);
    }

    /// Gives the admission back without an outcome.
    fn withdraw(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        // Abandoned normal calls say nothing about the endpoint.
        if self.settled || !self.probe {
            return;
        }
        warn!(breaker = %self.breaker.name, "probe abandoned before completing");
        self.breaker.record(true, true);
    }
}

struct Slot<'a>(&'a AtomicUsize);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: ArcSwap<CircuitConfig>,
    in_flight: AtomicUsize,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config: ArcSwap::from_pointee(config),
            in_flight: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                probe_in_flight: false,
                outcomes: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> Arc<CircuitConfig> {
        self.config.load_full()
    }

    /// Swaps the settings used by later calls. State and recorded outcomes
    /// are kept; calls already running finish under their old budget.
    pub fn reconfigure(&self, config: CircuitConfig) {
        debug!(breaker = %self.name, ?config, "breaker reconfigured");
        self.config.store(Arc::new(config));
    }

    /// Current state. An open circuit whose sleep window has passed still
    /// reports `Open` until the next call turns it half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs `call` under the breaker.
    ///
    /// `call` receives a child of `ctx` whose deadline is capped by the
    /// configured timeout. On expiry that child is cancelled.
    ///
    /// # Errors
    ///
    /// `Open` or `Saturated` when the call is rejected without running,
    /// `Timeout` when the budget expires, `Transport` for the call's own
    /// failure.
    pub async fn call<F, Fut>(&self, ctx: &CallContext, call: F) -> Result<Response, BreakerError>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<Response, TransportError>>,
    {
        let config = self.config();
        let admission = self.admit(&config)?;
        let Some(_slot) = self.reserve(config.max_concurrency.max(1)) else {
            admission.withdraw();
            debug!(breaker = %self.name, "rejected: concurrency limit");
            return Err(BreakerError::Saturated(config.max_concurrency));
        };

        let call_ctx = ctx.child().with_timeout(config.timeout);
        let result = tokio::select! {
            result = call(call_ctx.clone()) => result.map_err(BreakerError::from),
            () = call_ctx.expired() => {
                call_ctx.cancel();
                Err(BreakerError::Timeout(config.timeout))
            }
        };

        // A remote failure envelope is still a completed exchange.
        admission.settle(result.is_err());
        result
    }

    fn reserve(&self, limit: usize) -> Option<Slot<'_>> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Slot(&self.in_flight))
    }

    fn admit(&self, config: &CircuitConfig) -> Result<Admission<'_>, BreakerError> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let slept = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= config.sleep_window);
                if !slept {
                    return Err(BreakerError::Open);
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                debug!(breaker = %self.name, "half-open: admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(BreakerError::Open);
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(Admission {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record(&self, probe: bool, failed: bool) {
        let config = self.config.load();
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if probe {
            inner.probe_in_flight = false;
            if failed {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            } else {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.outcomes.clear();
                info!(breaker = %self.name, "probe succeeded, circuit closed");
            }
            return;
        }

        inner.outcomes.push_back((now, failed));
        while inner
            .outcomes
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > config.window)
        {
            inner.outcomes.pop_front();
        }

        if inner.state != CircuitState::Closed {
            return;
        }
        let total = inner.outcomes.len();
        if total < config.request_volume_threshold as usize {
            return;
        }
        let failures = inner.outcomes.iter().filter(|(_, failed)| *failed).count();
        if failures * 100 >= total * usize::from(config.error_percent_threshold) {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(breaker = %self.name, failures, total, "error threshold reached, circuit opened");
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Breakers keyed by `service/interface`, owned by whoever makes calls.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(service: &str, interface: &str) -> String {
        format!("{service}/{interface}")
    }

    /// Returns the breaker for `key`, configured with `config`.
    ///
    /// An existing breaker with other settings is reconfigured in place and
    /// keeps its state.
    pub fn ensure(&self, key: &str, config: &CircuitConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::clone(
            self.breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, config.clone())))
                .value(),
        );
        if *breaker.config() != *config {
            breaker.reconfigure(config.clone());
        }
        breaker
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| Arc::clone(b.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Drops every breaker; the next call starts Closed.
    pub fn reset(&self) {
        self.breakers.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
