//! Discovery port: resolves a logical service name to endpoints.
//!
//! The registry client itself (Consul or similar) lives outside this crate;
//! anything that implements [`Discovery`] can feed the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

/// Endpoint addresses (`host:port`) with their registry ids, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub addrs: Vec<String>,
    pub ids: Vec<String>,
}

impl Endpoints {
    /// Endpoints whose ids are their addresses.
    #[must_use]
    pub fn from_addrs<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
        Self {
            ids: addrs.clone(),
            addrs,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("service {0} is not registered")]
    UnknownService(String),
    #[error("discovery backend failed: {0:#}")]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// # Errors
    ///
    /// Backend failures. An empty result is `Ok`; callers decide whether
    /// zero endpoints is an error.
    async fn resolve(&self, service: &str) -> Result<Endpoints, DiscoveryError>;
}

// ---------------------------------------------------------------------------
// StaticDiscovery
// ---------------------------------------------------------------------------

/// Fixed service table, for tests and single-host deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Endpoints>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service<I, S>(mut self, service: impl Into<String>, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.insert(service.into(), Endpoints::from_addrs(addrs));
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, service: &str) -> Result<Endpoints, DiscoveryError> {
        self.services
            .get(service)
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownService(service.to_string()))
    }
}

// ---------------------------------------------------------------------------
// discovery_fn
// ---------------------------------------------------------------------------

struct FnDiscovery<F>(F);

#[async_trait]
impl<F> Discovery for FnDiscovery<F>
where
    F: Fn(&str) -> Result<Endpoints, DiscoveryError> + Send + Sync + 'static,
{
    async fn resolve(&self, service: &str) -> Result<Endpoints, DiscoveryError> {
        (self.0)(service)
    }
}

/// Adapts a synchronous lookup function.
pub fn discovery_fn<F>(f: F) -> impl Discovery
where
    F: Fn(&str) -> Result<Endpoints, DiscoveryError> + Send + Sync + 'static,
{
    FnDiscovery(f)
}

// ---------------------------------------------------------------------------
// CachedDiscovery
// ---------------------------------------------------------------------------

/// TTL cache in front of a slower discovery backend.
///
/// Failed lookups are not cached.
pub struct CachedDiscovery {
    inner: Arc<dyn Discovery>,
    ttl: Duration,
    cache: DashMap<String, (Instant, Endpoints)>,
}

impl CachedDiscovery {
    #[must_use]
    pub fn new(inner: Arc<dyn Discovery>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    pub fn invalidate(&self, service: &str) {
        self.cache.remove(service);
    }
}

#[async_trait]
impl Discovery for CachedDiscovery {
    async fn resolve(&self, service: &str) -> Result<Endpoints, DiscoveryError> {
        if let Some(entry) = self.cache.get(service) {
            let (fetched_at, endpoints) = entry.value();
            if fetched_at.elapsed() < self.ttl {
                return Ok(endpoints.clone());
            }
        }
        let endpoints = self.inner.resolve(service).await?;
        self.cache
            .insert(service.to_string(), (Instant::now(), endpoints.clone()));
        Ok(endpoints)
    }
}
