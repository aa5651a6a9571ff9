//! Connection pool for one endpoint that grows under sustained load.
//!
//! Starts with one connection. Every acquisition counts toward the current
//! window; once the count exceeds `scale_threshold` per pooled connection,
//! one connection is added before the caller is served. Scale check, growth
//! and selection happen under one lock.
//!
//! [`BalancerSet`] keeps one balancer per target and opens each on first use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::TransportError;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn connect(&self, target: &str) -> Result<Self::Connection, TransportError>;

    /// Dead connections are replaced on acquisition.
    fn is_alive(&self, _conn: &Self::Connection) -> bool {
        true
    }

    fn close(&self, _conn: &Self::Connection) {}
}

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub max_connections: usize,
    /// Acquisitions per connection per window before the pool grows.
    pub scale_threshold: u64,
    pub window: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            scale_threshold: 2000,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("balancer closed")]
    Closed,
    #[error("balancer already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Connect(#[from] TransportError),
}

impl From<BalancerError> for TransportError {
    fn from(err: BalancerError) -> Self {
        match err {
            BalancerError::Closed | BalancerError::AlreadyClosed => Self::Closed,
            BalancerError::Connect(err) => err,
        }
    }
}

struct Pool<T> {
    conns: Vec<Arc<T>>,
    window_start: Instant,
    window_count: u64,
    closed: bool,
}

pub struct ConnectionBalancer<C: Connector> {
    target: String,
    connector: C,
    config: BalancerConfig,
    pool: Mutex<Pool<C::Connection>>,
    accesses: AtomicU64,
}

impl<C: Connector> std::fmt::Debug for ConnectionBalancer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBalancer")
            .field("target", &self.target)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionBalancer<C> {
    /// Opens the first connection to `target`.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the first connection fails.
    pub async fn connect(
        target: impl Into<String>,
        connector: C,
        config: BalancerConfig,
    ) -> Result<Self, BalancerError> {
        let target = target.into();
        let first = connector.connect(&target).await?;
        debug!(%target, "balancer opened first connection");
        Ok(Self {
            target,
            connector,
            config,
            pool: Mutex::new(Pool {
                conns: vec![Arc::new(first)],
                window_start: Instant::now(),
                window_count: 0,
                closed: false,
            }),
            accesses: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn connection_count(&self) -> usize {
        self.pool.lock().await.conns.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.pool.lock().await.closed
    }

    /// Picks a pooled connection, growing the pool first when the current
    /// window is over threshold.
    ///
    /// # Errors
    ///
    /// `Closed` after [`Self::close`]; `Connect` if a dead connection cannot
    /// be replaced.
    pub async fn acquire(&self) -> Result<Arc<C::Connection>, BalancerError> {
        let mut pool = self.pool.lock().await;
        if pool.closed {
            return Err(BalancerError::Closed);
        }

        let now = Instant::now();
        if now.duration_since(pool.window_start) >= self.config.window {
            pool.window_start = now;
            pool.window_count = 0;
        }
        pool.window_count += 1;

        let size = pool.conns.len();
        let limit = self.config.scale_threshold.saturating_mul(size as u64);
        if pool.window_count > limit && size < self.config.max_connections {
            match self.connector.connect(&self.target).await {
                Ok(conn) => {
                    pool.conns.push(Arc::new(conn));
                    info!(target = %self.target, connections = size + 1, "balancer scaled up");
                }
                Err(err) => {
                    warn!(target = %self.target, error = %err, "scale-up failed, serving from existing pool");
                }
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let index = (self.accesses.fetch_add(1, Ordering::Relaxed) % pool.conns.len() as u64) as usize;
        let current = Arc::clone(&pool.conns[index]);
        if self.connector.is_alive(&current) {
            return Ok(current);
        }

        debug!(target = %self.target, index, "replacing dead connection");
        let fresh = Arc::new(self.connector.connect(&self.target).await?);
        pool.conns[index] = Arc::clone(&fresh);
        Ok(fresh)
    }

    /// Closes every pooled connection.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` on the second call.
    pub async fn close(&self) -> Result<(), BalancerError> {
        let mut pool = self.pool.lock().await;
        if pool.closed {
            return Err(BalancerError::AlreadyClosed);
        }
        pool.closed = true;
        for conn in pool.conns.drain(..) {
            self.connector.close(&conn);
        }
        debug!(target = %self.target, "balancer closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BalancerSet
// ---------------------------------------------------------------------------

type BalancerCell<C> = Arc<OnceCell<Arc<ConnectionBalancer<C>>>>;

/// One lazily opened balancer per target. Openings for different targets
/// never wait on each other; concurrent first calls to the same target
/// share one opening.
pub struct BalancerSet<C: Connector + Clone> {
    connector: C,
    config: BalancerConfig,
    balancers: DashMap<String, BalancerCell<C>>,
}

impl<C: Connector + Clone> BalancerSet<C> {
    #[must_use]
    pub fn new(connector: C, config: BalancerConfig) -> Self {
        Self {
            connector,
            config,
            balancers: DashMap::new(),
        }
    }

    /// Targets with an open balancer.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        self.balancers
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Returns the balancer for `target`, opening it on first use.
    ///
    /// # Errors
    ///
    /// The connect error when the first connection fails. Nothing is kept,
    /// so the next call tries again.
    pub async fn get_or_open(&self, target: &str) -> Result<Arc<ConnectionBalancer<C>>, TransportError> {
        let cell = Arc::clone(self.balancers.entry(target.to_string()).or_default().value());
        let opened = cell
            .get_or_try_init(|| async {
                let balancer =
                    ConnectionBalancer::connect(target, self.connector.clone(), self.config.clone()).await?;
                debug!(target, "balancer opened");
                Ok::<_, BalancerError>(Arc::new(balancer))
            })
            .await;
        match opened {
            Ok(balancer) => Ok(Arc::clone(balancer)),
            Err(err) => {
                self.balancers
                    .remove_if(target, |_, current| Arc::ptr_eq(current, &cell) && !current.initialized());
                Err(err.into())
            }
        }
    }

    /// Drops and closes the balancer for `target`, if any.
    pub async fn remove(&self, target: &str) {
        let Some((_, cell)) = self.balancers.remove(target) else {
            return;
        };
        let Some(balancer) = cell.get() else {
            return;
        };
        if let Err(err) = balancer.close().await {
            warn!(target, error = %err, "closing balancer");
        }
        debug!(target, "balancer removed");
    }

    pub async fn remove_all(&self) {
        let targets: Vec<String> = self.balancers.iter().map(|entry| entry.key().clone()).collect();
        for target in targets {
            self.remove(&target).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
