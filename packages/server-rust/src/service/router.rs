//! Call routing: dispatches an envelope to a local handler or a proxy rule.
//!
//! A `Router` is built once at startup (handlers, groups, proxy rules) and
//! then shared behind an `Arc`. Lookups take read locks only; registration
//! takes the write lock of the structure it changes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use meshrpc_core::{Request, Response, RpcError};
use parking_lot::RwLock;
use tower::Service;
use tracing::debug;

use super::binding::{self, CallBinding, CallParts, ErasedHandler, Handler, RegistrationError, Route};
use super::context::{CallContext, RpcCall};
use super::group::{self, GroupId, GroupTree, PreProcess};
use super::proxy::{self, Matcher, ProxyResolver, ProxyRule, ProxyTarget, StaticResolver};

// ---------------------------------------------------------------------------
// MethodEntry
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct MethodEntry {
    group: GroupId,
    binding: CallBinding,
    handler: Arc<dyn ErasedHandler>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Handler index, group tree and proxy rules of one server.
pub struct Router {
    methods: RwLock<HashMap<String, MethodEntry>>,
    groups: RwLock<GroupTree>,
    proxies: RwLock<Vec<ProxyRule>>,
}

impl Router {
    /// Creates a router containing only the root group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            groups: RwLock::new(GroupTree::new()),
            proxies: RwLock::new(Vec::new()),
        }
    }

    /// Handle to the root group.
    #[must_use]
    pub fn root(&self) -> GroupHandle<'_> {
        GroupHandle {
            router: self,
            id: GroupId::ROOT,
        }
    }

    /// Creates a child of the root group.
    ///
    /// # Errors
    ///
    /// Never fails for the root; kept fallible to match [`GroupHandle::group`].
    pub fn group(&self, name: &str) -> Result<GroupHandle<'_>, RegistrationError> {
        self.root().group(name)
    }

    /// Registers `handler` in the root group.
    ///
    /// # Errors
    ///
    /// See [`GroupHandle::register`].
    pub fn register<H, Args>(&self, route: impl Into<Route>, handler: H) -> Result<(), RegistrationError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.register_in(GroupId::ROOT, route.into(), handler)
    }

    fn register_in<H, Args>(
        &self,
        group: GroupId,
        route: Route,
        handler: H,
    ) -> Result<(), RegistrationError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let interface = route.into_validated()?;
        let (binding, handler) = binding::bind(handler)?;

        if !self.groups.read().contains(group) {
            return Err(RegistrationError::UnknownGroup(group.0));
        }

        let mut methods = self.methods.write();
        if methods.contains_key(&interface) {
            return Err(RegistrationError::Duplicate { interface });
        }
        debug!(interface = %interface, params = ?binding.params(), "handler registered");
        methods.insert(
            interface,
            MethodEntry {
                group,
                binding,
                handler,
            },
        );
        Ok(())
    }

    fn add_proxy(
        &self,
        group: GroupId,
        matcher: Matcher,
        resolver: Arc<dyn ProxyResolver>,
    ) -> Result<(), RegistrationError> {
        if !self.groups.read().contains(group) {
            return Err(RegistrationError::UnknownGroup(group.0));
        }
        self.proxies.write().push(ProxyRule {
            group,
            matcher,
            resolver,
        });
        Ok(())
    }

    /// Call binding of a registered interface.
    #[must_use]
    pub fn binding(&self, interface: &str) -> Option<CallBinding> {
        self.methods
            .read()
            .get(interface)
            .map(|entry| entry.binding.clone())
    }

    /// Registered interface identifiers, sorted.
    #[must_use]
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn proxy_rule_count(&self) -> usize {
        self.proxies.read().len()
    }

    /// Group path a registered interface belongs to, e.g. `/admin/v1`.
    #[must_use]
    pub fn group_path(&self, interface: &str) -> Option<String> {
        let group = self.methods.read().get(interface)?.group;
        Some(self.groups.read().path(group))
    }

    fn chain(&self, group: GroupId) -> Vec<Arc<dyn PreProcess>> {
        self.groups.read().chain(group)
    }

    /// Routes one call.
    ///
    /// Local handlers take precedence over proxy rules. Before either runs,
    /// the owning group's pre-processing chain is applied.
    ///
    /// # Errors
    ///
    /// Returns the structured error of whichever stage failed: an empty or
    /// unknown interface yields `GRPC_METHOD_NOTFOUND`.
    pub async fn dispatch(&self, mut ctx: CallContext, request: Request) -> Result<Response, RpcError> {
        if request.req_interface.is_empty() {
            return Err(RpcError::method_not_found(""));
        }

        let entry = self.methods.read().get(&request.req_interface).cloned();
        if let Some(entry) = entry {
            debug!(interface = %request.req_interface, "dispatching to local handler");
            group::run_chain(&self.chain(entry.group), &mut ctx, &request).await?;
            let parts = CallParts {
                ctx,
                request: Arc::new(request),
            };
            return entry.handler.call(parts).await;
        }

        let rule = proxy::first_match(
            &self.proxies.read(),
            &request.req_service,
            &request.req_interface,
        )
        .cloned();
        if let Some(rule) = rule {
            debug!(
                service = %request.req_service,
                interface = %request.req_interface,
                "dispatching through proxy rule"
            );
            group::run_chain(&self.chain(rule.group), &mut ctx, &request).await?;
            let target = rule.resolver.resolve(&ctx, &request).await?;
            return target.forward(ctx, request).await;
        }

        debug!(interface = %request.req_interface, "no handler or proxy rule");
        Err(RpcError::method_not_found(&request.req_interface))
    }

    /// Wraps the router as the innermost `tower::Service` of the pipeline.
    #[must_use]
    pub fn into_service(self: Arc<Self>) -> DispatchService {
        DispatchService { router: self }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// GroupHandle
// ---------------------------------------------------------------------------

/// Registration handle scoped to one group.
#[derive(Clone, Copy)]
pub struct GroupHandle<'r> {
    router: &'r Router,
    id: GroupId,
}

impl<'r> GroupHandle<'r> {
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Creates a child group inheriting this group's chain.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::UnknownGroup` if this handle is stale.
    pub fn group(&self, name: &str) -> Result<GroupHandle<'r>, RegistrationError> {
        let id = self.router.groups.write().add_child(self.id, name)?;
        Ok(GroupHandle {
            router: self.router,
            id,
        })
    }

    /// Appends a pre-processing step to this group.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::UnknownGroup` if this handle is stale.
    pub fn pre_process(&self, step: impl PreProcess) -> Result<&Self, RegistrationError> {
        self.router.groups.write().push_step(self.id, Arc::new(step))?;
        Ok(self)
    }

    /// Registers `handler` under `route` in this group.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::EmptyInterface`, `Duplicate` or
    /// `DuplicateRole`. All of them are startup failures.
    pub fn register<H, Args>(&self, route: impl Into<Route>, handler: H) -> Result<&Self, RegistrationError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.router.register_in(self.id, route.into(), handler)?;
        Ok(self)
    }

    /// Adds a proxy rule owned by this group.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::UnknownGroup` if this handle is stale.
    pub fn proxy(&self, matcher: Matcher, resolver: impl ProxyResolver + 'static) -> Result<&Self, RegistrationError> {
        self.router.add_proxy(self.id, matcher, Arc::new(resolver))?;
        Ok(self)
    }

    /// Forwards every interface of `service` to `target`.
    ///
    /// # Errors
    ///
    /// See [`Self::proxy`].
    pub fn proxy_service(&self, service: &str, target: ProxyTarget) -> Result<&Self, RegistrationError> {
        self.proxy(proxy::match_service(service), StaticResolver::new(target))
    }

    /// Forwards the listed interfaces of `service` to `target`.
    ///
    /// # Errors
    ///
    /// See [`Self::proxy`].
    pub fn proxy_service_interfaces<I, S>(
        &self,
        service: &str,
        interfaces: I,
        target: ProxyTarget,
    ) -> Result<&Self, RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxy(
            proxy::match_service_interfaces(service, interfaces),
            StaticResolver::new(target),
        )
    }

    /// Forwards `interface` to `target` whatever the service name.
    ///
    /// # Errors
    ///
    /// See [`Self::proxy`].
    pub fn proxy_interface(&self, interface: &str, target: ProxyTarget) -> Result<&Self, RegistrationError> {
        self.proxy(proxy::match_interface(interface), StaticResolver::new(target))
    }
}

// ---------------------------------------------------------------------------
// DispatchService
// ---------------------------------------------------------------------------

/// `tower::Service` adapter over a shared [`Router`].
#[derive(Clone)]
pub struct DispatchService {
    router: Arc<Router>,
}

impl Service<RpcCall> for DispatchService {
    type Response = Response;
    type Error = RpcError;
    type Future = Pin<Box<dyn Future<Output = Result<Response, RpcError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: RpcCall) -> Self::Future {
        let router = Arc::clone(&self.router);
        Box::pin(async move { router.dispatch(call.ctx, call.request).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
