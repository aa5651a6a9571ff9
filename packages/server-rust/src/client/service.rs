//! Client handle for one logical service.
//!
//! Each call resolves endpoints through [`Discovery`], picks one round robin,
//! optionally runs the exchange inside a per-interface circuit breaker, and
//! translates every failure into an [`RpcError`] with a stable code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshrpc_core::{codes, decode_message, encode_message, Request, Response, RpcError, RpcResponse};
use serde::Serialize;
use tracing::debug;

use super::breaker::{BreakerRegistry, CircuitConfig};
use super::discovery::Discovery;
use super::transport::Transport;
use crate::service::{CallContext, Forwarder};

/// Downgrades a failed call to a recovered result.
pub type Fallback<'a> = Box<dyn FnOnce(RpcError) -> Result<Response, RpcError> + Send + 'a>;

pub struct Service {
    name: String,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    counter: AtomicU64,
    breakers: Arc<BreakerRegistry>,
}

impl Service {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            discovery,
            transport,
            counter: AtomicU64::new(0),
            breakers: Arc::new(BreakerRegistry::new()),
        }
    }

    /// Shares `breakers` instead of owning a private registry.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Starts a call to `interface`.
    pub fn call(&self, interface: impl Into<String>) -> CallBuilder<'_> {
        CallBuilder {
            service: self,
            interface: interface.into(),
            header: Vec::new(),
            body: Vec::new(),
            encode_error: None,
            ctx: None,
            timeout: None,
            circuit: None,
            fallback: None,
        }
    }

    async fn select_endpoint(&self) -> Result<String, RpcError> {
        let endpoints = self.discovery.resolve(&self.name).await.map_err(|err| {
            RpcError::named(codes::DISCOVERY_FAILED, format!("{}: {err}", self.name))
        })?;
        if endpoints.is_empty() {
            return Err(RpcError::named(
                codes::DISCOVERY_FAILED,
                format!("service {} not found", self.name),
            ));
        }

        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let index = (ticket % endpoints.len() as u64) as usize;
        let mut addrs = endpoints.addrs;
        Ok(addrs.swap_remove(index))
    }

    async fn exchange(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        request: Request,
        circuit: Option<&CircuitConfig>,
    ) -> Result<Response, RpcError> {
        let kind = self.transport.kind();
        let Some(config) = circuit else {
            return self
                .transport
                .invoke(ctx.child(), endpoint, request)
                .await
                .map_err(|err| kind.translate(&err));
        };

        let key = BreakerRegistry::key(&self.name, &request.req_interface);
        let breaker = self.breakers.ensure(&key, config);
        let transport = &self.transport;
        breaker
            .call(ctx, |call_ctx| transport.invoke(call_ctx, endpoint, request))
            .await
            .map_err(|err| kind.translate_breaker(&err))
    }
}

#[async_trait]
impl Forwarder for Service {
    async fn forward(&self, ctx: CallContext, request: Request) -> Result<Response, RpcError> {
        let endpoint = self.select_endpoint().await?;
        debug!(service = %self.name, interface = %request.req_interface, %endpoint, "forwarding");
        self.exchange(&ctx, &endpoint, request, None).await
    }
}

// ---------------------------------------------------------------------------
// CallBuilder
// ---------------------------------------------------------------------------

/// Accumulates one call's settings; consumed by [`Self::send`] or
/// [`Self::response`].
#[must_use]
pub struct CallBuilder<'a> {
    service: &'a Service,
    interface: String,
    header: Vec<u8>,
    body: Vec<u8>,
    encode_error: Option<RpcError>,
    ctx: Option<CallContext>,
    timeout: Option<Duration>,
    circuit: Option<CircuitConfig>,
    fallback: Option<Fallback<'a>>,
}

impl<'a> CallBuilder<'a> {
    /// Encodes a typed header. Encoding failures surface from `send`.
    pub fn header<H: Serialize>(mut self, header: &H) -> Self {
        match encode_message(header) {
            Ok(bytes) => self.header = bytes,
            Err(err) => self.encode_error = Some(RpcError::bad_header(&err)),
        }
        self
    }

    /// Encodes a typed body. Encoding failures surface from `send`.
    pub fn body<B: Serialize>(mut self, body: &B) -> Self {
        match encode_message(body) {
            Ok(bytes) => self.body = bytes,
            Err(err) => self.encode_error = Some(RpcError::bad_body(&err)),
        }
        self
    }

    pub fn raw_header(mut self, header: Vec<u8>) -> Self {
        self.header = header;
        self
    }

    pub fn raw_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Parent context; cancelling it aborts the call.
    pub fn context(mut self, ctx: CallContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Call deadline. Also becomes the breaker timeout when a circuit is set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs the call inside the breaker for this `service/interface`.
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = Some(config);
        self
    }

    /// Recovers transport and breaker failures. Discovery failures and remote
    /// failure envelopes are not offered to the fallback.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: FnOnce(RpcError) -> Result<Response, RpcError> + Send + 'a,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Executes the call and returns the success envelope.
    ///
    /// # Errors
    ///
    /// `DISCOVERY_FAILED` when no endpoint is known, the transport's
    /// `*_TIMEOUT`/`*_ERROR` codes for exchange failures, or the remote
    /// `mcode` verbatim when the remote answered with a failure envelope.
    pub async fn send(self) -> Result<Response, RpcError> {
        let Self {
            service,
            interface,
            header,
            body,
            encode_error,
            ctx,
            timeout,
            mut circuit,
            fallback,
        } = self;
        if let Some(err) = encode_error {
            return Err(err);
        }

        let mut ctx = ctx.unwrap_or_default();
        if let Some(timeout) = timeout {
            ctx = ctx.with_timeout(timeout);
            if let Some(config) = circuit.as_mut() {
                config.timeout = timeout;
            }
        }

        let endpoint = service.select_endpoint().await?;
        debug!(service = %service.name, %interface, %endpoint, "calling");
        let request = Request::new(service.name.clone(), interface)
            .with_header(header)
            .with_body(body);

        let response = match service
            .exchange(&ctx, &endpoint, request, circuit.as_ref())
            .await
        {
            Ok(response) => response,
            Err(err) => match fallback {
                Some(fallback) => {
                    debug!(service = %service.name, error = %err, "applying fallback");
                    fallback(err)?
                }
                None => return Err(err),
            },
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(RpcError::from_response(&response))
        }
    }

    /// Executes the call and decodes the response body as `R`.
    ///
    /// # Errors
    ///
    /// Everything [`Self::send`] returns, plus `BAD_BODY` when the body does
    /// not decode.
    pub async fn response<R: RpcResponse>(self) -> Result<R, RpcError> {
        let response = self.send().await?;
        decode_message(&response.body).map_err(|err| RpcError::bad_body(&err))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
