//! Proxy rules: forward calls that have no local handler.
//!
//! A rule is a matcher over `(service name, interface name)` plus a resolver
//! that picks the forwarding target. Rules are tried in registration order;
//! the first matcher that accepts decides the outcome, even when its
//! resolver then fails.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshrpc_core::{codes, Request, Response, RpcError};

use super::context::CallContext;
use super::group::GroupId;

// ---------------------------------------------------------------------------
// Forwarder / ProxyTarget
// ---------------------------------------------------------------------------

/// Something that can carry an envelope to another service and return the
/// remote envelope as-is. Implemented by [`crate::client::Service`].
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forwards `request`. A remote failure envelope is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// Returns discovery, transport or breaker errors.
    async fn forward(&self, ctx: CallContext, request: Request) -> Result<Response, RpcError>;
}

pub type ProxyTarget = Arc<dyn Forwarder>;

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// Predicate over `(service name, interface name)`.
pub type Matcher = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Matches every interface of `service`.
pub fn match_service(service: impl Into<String>) -> Matcher {
    let service = service.into();
    Arc::new(move |svc: &str, _iface: &str| svc == service)
}

/// Matches `service` restricted to an explicit interface allow-list.
pub fn match_service_interfaces<I, S>(service: impl Into<String>, interfaces: I) -> Matcher
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let service = service.into();
    let allowed: HashSet<String> = interfaces.into_iter().map(Into::into).collect();
    Arc::new(move |svc: &str, iface: &str| svc == service && allowed.contains(iface))
}

/// Matches `service` when `predicate` accepts the interface name.
pub fn match_service_where<P>(service: impl Into<String>, predicate: P) -> Matcher
where
    P: Fn(&str) -> bool + Send + Sync + 'static,
{
    let service = service.into();
    Arc::new(move |svc: &str, iface: &str| svc == service && predicate(iface))
}

/// Matches an interface name regardless of service name.
pub fn match_interface(interface: impl Into<String>) -> Matcher {
    let interface = interface.into();
    Arc::new(move |_svc: &str, iface: &str| iface == interface)
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Chooses the forwarding target for a matched call.
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    async fn resolve(&self, ctx: &CallContext, request: &Request) -> Result<ProxyTarget, RpcError>;
}

/// Always forwards to the same target.
pub struct StaticResolver(ProxyTarget);

impl StaticResolver {
    #[must_use]
    pub fn new(target: ProxyTarget) -> Self {
        Self(target)
    }
}

#[async_trait]
impl ProxyResolver for StaticResolver {
    async fn resolve(&self, _ctx: &CallContext, _request: &Request) -> Result<ProxyTarget, RpcError> {
        Ok(Arc::clone(&self.0))
    }
}

struct FnResolver<F>(F);

#[async_trait]
impl<F> ProxyResolver for FnResolver<F>
where
    F: Fn(&CallContext, &Request) -> Result<ProxyTarget, RpcError> + Send + Sync + 'static,
{
    async fn resolve(&self, ctx: &CallContext, request: &Request) -> Result<ProxyTarget, RpcError> {
        (self.0)(ctx, request)
    }
}

/// Per-request resolver, e.g. sharding on a header field.
pub fn resolve_fn<F>(f: F) -> impl ProxyResolver
where
    F: Fn(&CallContext, &Request) -> Result<ProxyTarget, RpcError> + Send + Sync + 'static,
{
    FnResolver(f)
}

/// Error for resolvers that cannot produce a target.
#[must_use]
pub fn resolve_failed(message: impl Into<String>) -> RpcError {
    RpcError::named(codes::PROXY_RESOLVE_FAILED, message)
}

// ---------------------------------------------------------------------------
// ProxyRule
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ProxyRule {
    pub(crate) group: GroupId,
    pub(crate) matcher: Matcher,
    pub(crate) resolver: Arc<dyn ProxyResolver>,
}

impl ProxyRule {
    pub(crate) fn matches(&self, service: &str, interface: &str) -> bool {
        (self.matcher)(service, interface)
    }
}

impl fmt::Debug for ProxyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRule")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// First rule whose matcher accepts the call.
pub(crate) fn first_match<'a>(
    rules: &'a [ProxyRule],
    service: &str,
    interface: &str,
) -> Option<&'a ProxyRule> {
    rules.iter().find(|rule| rule.matches(service, interface))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Echo;

    #[async_trait]
    impl Forwarder for Echo {
        async fn forward(&self, _ctx: CallContext, request: Request) -> Result<Response, RpcError> {
            Ok(Response::ok(request.body))
        }
    }

    #[test]
    fn service_matchers() {
        let any = match_service("billing");
        assert!(any("billing", "Pay"));
        assert!(!any("users", "Pay"));

        let listed = match_service_interfaces("billing", ["Pay", "Refund"]);
        assert!(listed("billing", "Refund"));
        assert!(!listed("billing", "Audit"));

        let filtered = match_service_where("billing", |iface| iface.starts_with("Admin"));
        assert!(filtered("billing", "AdminReset"));
        assert!(!filtered("billing", "Pay"));
        assert!(!filtered("users", "AdminReset"));
    }

    #[test]
    fn interface_matcher_ignores_service() {
        let m = match_interface("Ping");
        assert!(m("", "Ping"));
        assert!(m("anything", "Ping"));
        assert!(!m("anything", "Pong"));
    }

    #[test]
    fn first_match_stops_at_first_accepting_rule() {
        let evaluated = Arc::new(AtomicUsize::new(0));
        let counting = |accept: bool| -> Matcher {
            let evaluated = Arc::clone(&evaluated);
            Arc::new(move |_s: &str, _i: &str| {
                evaluated.fetch_add(1, Ordering::SeqCst);
                accept
            })
        };
        let target: ProxyTarget = Arc::new(Echo);
        let rules: Vec<ProxyRule> = [false, true, true]
            .into_iter()
            .map(|accept| ProxyRule {
                group: GroupId::ROOT,
                matcher: counting(accept),
                resolver: Arc::new(StaticResolver::new(Arc::clone(&target))),
            })
            .collect();

        let hit = first_match(&rules, "svc", "Any").unwrap();
        assert!(std::ptr::eq(hit, &rules[1]));
        assert_eq!(evaluated.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dynamic_resolver_sees_request() {
        let target: ProxyTarget = Arc::new(Echo);
        let resolver = resolve_fn(move |_ctx, req| {
            if req.req_service == "known" {
                Ok(Arc::clone(&target))
            } else {
                Err(resolve_failed("no shard"))
            }
        });
        let ctx = CallContext::new();
        assert!(resolver.resolve(&ctx, &Request::new("known", "X")).await.is_ok());
        let err = resolver
            .resolve(&ctx, &Request::new("other", "X"))
            .await
            .err()
            .unwrap();
        assert!(err.has_code(codes::PROXY_RESOLVE_FAILED));
    }
}
