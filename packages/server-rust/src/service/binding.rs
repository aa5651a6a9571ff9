//! Handler registration: call bindings, argument extractors and outcomes.
//!
//! A handler is any `async` function or closure whose parameters implement
//! [`FromCall`] and whose output implements [`IntoOutcome`]. The parameter
//! roles are fixed by type, so an unsupported parameter or result shape is a
//! compile error rather than a startup failure:
//!
//! | Parameter        | Role                 |
//! |------------------|----------------------|
//! | [`CallContext`]  | context              |
//! | [`Header<H>`]    | typed header         |
//! | [`Body<B>`]      | typed body           |
//! | [`RawRequest`]   | raw envelope request |
//!
//! | Output                         | Roles                       |
//! |--------------------------------|-----------------------------|
//! | `()`                           | none (always succeeds)      |
//! | `Result<(), E>`                | error                       |
//! | [`Response`]                   | raw envelope response       |
//! | `Result<R, E>`                 | typed response, error       |
//! | `Result<Option<R>, E>`         | typed response, error       |
//!
//! The only rule left for registration time is "at most one parameter per
//! role", checked by [`CallBinding::new`].

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use meshrpc_core::{decode_message, Request, Response, RpcError, RpcHeader, RpcRequest};
pub use meshrpc_core::{IntoOutcome, OutputRole};

use super::context::CallContext;

pub(crate) type BoxedFuture = Pin<Box<dyn Future<Output = Result<Response, RpcError>> + Send>>;

// ---------------------------------------------------------------------------
// RegistrationError
// ---------------------------------------------------------------------------

/// Configuration error raised while registering handlers, groups or proxy
/// rules. These abort startup; they never happen while serving.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("interface identifier must not be empty")]
    EmptyInterface,
    #[error("interface {interface:?} is already registered")]
    Duplicate { interface: String },
    #[error("handler declares more than one {role} parameter")]
    DuplicateRole { role: ParamRole },
    #[error("unknown group id {0}")]
    UnknownGroup(usize),
}

// ---------------------------------------------------------------------------
// Roles and CallBinding
// ---------------------------------------------------------------------------

/// Role of one handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    Context,
    EnvelopeRequest,
    TypedHeader,
    TypedBody,
}

impl fmt::Display for ParamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Context => "context",
            Self::EnvelopeRequest => "raw envelope request",
            Self::TypedHeader => "typed header",
            Self::TypedBody => "typed body",
        })
    }
}

/// Positional description of a registered handler's parameters and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallBinding {
    params: Vec<ParamRole>,
    outputs: &'static [OutputRole],
}

impl CallBinding {
    /// Builds a binding, rejecting repeated parameter roles.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::DuplicateRole` if two parameters share a role.
    pub fn new(
        params: Vec<ParamRole>,
        outputs: &'static [OutputRole],
    ) -> Result<Self, RegistrationError> {
        for (i, role) in params.iter().enumerate() {
            if params[..i].contains(role) {
                return Err(RegistrationError::DuplicateRole { role: *role });
            }
        }
        Ok(Self { params, outputs })
    }

    #[must_use]
    pub fn params(&self) -> &[ParamRole] {
        &self.params
    }

    #[must_use]
    pub fn outputs(&self) -> &'static [OutputRole] {
        self.outputs
    }

    /// Position of the parameter with `role`, if the handler takes one.
    #[must_use]
    pub fn position(&self, role: ParamRole) -> Option<usize> {
        self.params.iter().position(|r| *r == role)
    }

    /// Handlers without outputs always produce an empty successful response.
    #[must_use]
    pub fn always_succeeds(&self) -> bool {
        self.outputs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Interface identifier a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route(String);

impl Route {
    /// Literal identifier.
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Identifier taken from a typed body, see [`RpcRequest::interface_name`].
    #[must_use]
    pub fn of<B: RpcRequest>() -> Self {
        Self(B::interface_name().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_validated(self) -> Result<String, RegistrationError> {
        if self.0.is_empty() {
            return Err(RegistrationError::EmptyInterface);
        }
        Ok(self.0)
    }
}

impl From<&str> for Route {
    fn from(name: &str) -> Self {
        Self::name(name)
    }
}

impl From<String> for Route {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// Everything a handler invocation can draw its arguments from.
#[derive(Debug, Clone)]
pub struct CallParts {
    pub ctx: CallContext,
    pub request: Arc<Request>,
}

/// A type that can be supplied as a handler parameter.
pub trait FromCall: Sized + Send + 'static {
    const ROLE: ParamRole;

    /// Builds the argument from the call.
    ///
    /// # Errors
    ///
    /// Returns `BAD_HEADER` / `BAD_BODY` errors when typed payloads fail to decode.
    fn from_call(parts: &CallParts) -> Result<Self, RpcError>;
}

impl FromCall for CallContext {
    const ROLE: ParamRole = ParamRole::Context;

    fn from_call(parts: &CallParts) -> Result<Self, RpcError> {
        Ok(parts.ctx.clone())
    }
}

/// Typed header decoded from the envelope's header bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header<H>(pub H);

impl<H: RpcHeader> FromCall for Header<H> {
    const ROLE: ParamRole = ParamRole::TypedHeader;

    fn from_call(parts: &CallParts) -> Result<Self, RpcError> {
        decode_message(&parts.request.header)
            .map(Header)
            .map_err(|e| RpcError::bad_header(&e))
    }
}

/// Typed body decoded from the envelope's body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body<B>(pub B);

impl<B: RpcRequest> FromCall for Body<B> {
    const ROLE: ParamRole = ParamRole::TypedBody;

    fn from_call(parts: &CallParts) -> Result<Self, RpcError> {
        decode_message(&parts.request.body)
            .map(Body)
            .map_err(|e| RpcError::bad_body(&e))
    }
}

/// The undecoded envelope, shared with the dispatcher.
#[derive(Debug, Clone)]
pub struct RawRequest(pub Arc<Request>);

impl FromCall for RawRequest {
    const ROLE: ParamRole = ParamRole::EnvelopeRequest;

    fn from_call(parts: &CallParts) -> Result<Self, RpcError> {
        Ok(RawRequest(Arc::clone(&parts.request)))
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// An async function usable as an RPC handler. `Args` is the tuple of its
/// parameter types; it only exists to keep the blanket impls apart.
pub trait Handler<Args>: Clone + Send + Sync + 'static {
    fn params() -> Vec<ParamRole>;

    fn outputs() -> &'static [OutputRole];

    /// Extracts the arguments from `parts` and runs the handler.
    fn call(&self, parts: CallParts) -> BoxedFuture;
}

macro_rules! impl_handler {
    ($($ty:ident),*) => {
        impl<F, Fut, Out, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Out> + Send + 'static,
            Out: IntoOutcome,
            $($ty: FromCall,)*
        {
            fn params() -> Vec<ParamRole> {
                vec![$(<$ty as FromCall>::ROLE),*]
            }

            fn outputs() -> &'static [OutputRole] {
                Out::OUTPUTS
            }

            #[allow(non_snake_case, unused_variables)]
            fn call(&self, parts: CallParts) -> BoxedFuture {
                let handler = self.clone();
                Box::pin(async move {
                    $(let $ty = <$ty as FromCall>::from_call(&parts)?;)*
                    handler($($ty),*).await.into_outcome()
                })
            }
        }
    };
}

impl_handler!();
impl_handler!(A);
impl_handler!(A, B);
impl_handler!(A, B, C);
impl_handler!(A, B, C, D);

// ---------------------------------------------------------------------------
// Type-erased method entry
// ---------------------------------------------------------------------------

pub(crate) trait ErasedHandler: Send + Sync {
    fn call(&self, parts: CallParts) -> BoxedFuture;
}

struct HandlerFn<H, Args> {
    handler: H,
    _args: PhantomData<fn() -> Args>,
}

impl<H, Args> ErasedHandler for HandlerFn<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    fn call(&self, parts: CallParts) -> BoxedFuture {
        self.handler.call(parts)
    }
}

/// Binds `handler`, returning its call binding and a type-erased invoker.
pub(crate) fn bind<H, Args>(
    handler: H,
) -> Result<(CallBinding, Arc<dyn ErasedHandler>), RegistrationError>
where
    H: Handler<Args>,
    Args: 'static,
{
    let binding = CallBinding::new(H::params(), H::outputs())?;
    let erased = Arc::new(HandlerFn {
        handler,
        _args: PhantomData,
    });
    Ok((binding, erased))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use meshrpc_core::{codes, encode_message, ErrorCode, ErrorCodePrefix, RpcResponse};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct AccountHeader {
        account: String,
    }
    impl RpcHeader for AccountHeader {}

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct AddRequest {
        a: i64,
        b: i64,
    }
    impl RpcRequest for AddRequest {}

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct AddResponse {
        sum: i64,
    }
    impl RpcResponse for AddResponse {}

    fn parts(header: Vec<u8>, body: Vec<u8>) -> CallParts {
        CallParts {
            ctx: CallContext::new(),
            request: Arc::new(Request::new("calc", "Add").with_header(header).with_body(body)),
        }
    }

    async fn add(
        Header(h): Header<AccountHeader>,
        Body(b): Body<AddRequest>,
    ) -> Result<Option<AddResponse>, RpcError> {
        assert_eq!(h.account, "a");
        Ok(Some(AddResponse { sum: b.a + b.b }))
    }

    #[tokio::test]
    async fn typed_handler_binding_and_invocation() {
        let (binding, erased) = bind(add).unwrap();
        assert_eq!(
            binding.params(),
            &[ParamRole::TypedHeader, ParamRole::TypedBody]
        );
        assert_eq!(
            binding.outputs(),
            &[OutputRole::TypedResponse, OutputRole::Error]
        );

        let header = encode_message(&AccountHeader { account: "a".into() }).unwrap();
        let body = encode_message(&AddRequest { a: 1, b: 2 }).unwrap();
        let resp = erased.call(parts(header, body)).await.unwrap();
        assert!(resp.is_success());
        let out: AddResponse = decode_message(&resp.body).unwrap();
        assert_eq!(out, AddResponse { sum: 3 });
    }

    #[tokio::test]
    async fn bare_typed_response_needs_no_option() {
        let handler = |Body(b): Body<AddRequest>| async move {
            Ok::<_, RpcError>(AddResponse { sum: b.a * b.b })
        };
        let (binding, erased) = bind(handler).unwrap();
        assert_eq!(
            binding.outputs(),
            &[OutputRole::TypedResponse, OutputRole::Error]
        );
        let body = encode_message(&AddRequest { a: 3, b: 4 }).unwrap();
        let resp = erased.call(parts(vec![], body)).await.unwrap();
        let out: AddResponse = decode_message(&resp.body).unwrap();
        assert_eq!(out, AddResponse { sum: 12 });
    }

    #[tokio::test]
    async fn zero_output_handler_always_succeeds() {
        let (binding, erased) = bind(|_ctx: CallContext| async {}).unwrap();
        assert!(binding.always_succeeds());
        assert_eq!(binding.position(ParamRole::Context), Some(0));
        let resp = erased.call(parts(vec![], vec![])).await.unwrap();
        assert_eq!(resp, Response::empty());
    }

    #[tokio::test]
    async fn none_typed_response_is_empty_success() {
        let handler = |Body(_b): Body<AddRequest>| async {
            Ok::<Option<AddResponse>, RpcError>(None)
        };
        let (_, erased) = bind(handler).unwrap();
        let resp = erased.call(parts(vec![], vec![])).await.unwrap();
        assert!(resp.result);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn raw_envelope_in_and_out() {
        let handler = |RawRequest(req): RawRequest| async move {
            Response::ok(req.body.clone())
        };
        let (binding, erased) = bind(handler).unwrap();
        assert_eq!(binding.params(), &[ParamRole::EnvelopeRequest]);
        assert_eq!(binding.outputs(), &[OutputRole::RawEnvelopeResponse]);
        let resp = erased.call(parts(vec![], vec![9, 9])).await.unwrap();
        assert_eq!(resp.body, vec![9, 9]);
    }

    #[tokio::test]
    async fn error_only_handler_maps_numeric_error() {
        let handler = |_ctx: CallContext| async { Err::<(), _>(RpcError::numeric(400, "no")) };
        let (binding, erased) = bind(handler).unwrap();
        assert_eq!(binding.outputs(), &[OutputRole::Error]);
        let err = erased.call(parts(vec![], vec![])).await.unwrap_err();
        assert_eq!(err.mcode(&ErrorCodePrefix::new("SVC")), "SVC_400");
    }

    #[tokio::test]
    async fn anyhow_errors_are_accepted() {
        let handler = |_ctx: CallContext| async { Err::<(), _>(anyhow::anyhow!("broken")) };
        let (_, erased) = bind(handler).unwrap();
        let err = erased.call(parts(vec![], vec![])).await.unwrap_err();
        assert_eq!(err.code(), &ErrorCode::Numeric(codes::GENERIC_ERROR_NUMBER));
    }

    #[tokio::test]
    async fn malformed_header_is_bad_header() {
        let (_, erased) = bind(add).unwrap();
        let err = erased.call(parts(vec![0xc1], vec![])).await.unwrap_err();
        assert!(err.has_code(codes::BAD_HEADER));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_body() {
        let (_, erased) = bind(add).unwrap();
        let header = encode_message(&AccountHeader { account: "a".into() }).unwrap();
        let err = erased.call(parts(header, vec![0xc1])).await.unwrap_err();
        assert!(err.has_code(codes::BAD_BODY));
    }

    #[test]
    fn duplicate_role_is_rejected() {
        let handler = |_a: CallContext, _b: CallContext| async {};
        let err = bind(handler).err().unwrap();
        assert_eq!(
            err,
            RegistrationError::DuplicateRole {
                role: ParamRole::Context
            }
        );
    }

    #[test]
    fn all_four_roles_in_any_order() {
        let handler = |_r: RawRequest,
                       _b: Body<AddRequest>,
                       _c: CallContext,
                       _h: Header<AccountHeader>| async {};
        let (binding, _) = bind(handler).unwrap();
        assert_eq!(binding.position(ParamRole::TypedBody), Some(1));
        assert_eq!(binding.position(ParamRole::TypedHeader), Some(3));
    }

    #[test]
    fn route_of_uses_type_name_and_rejects_empty() {
        assert_eq!(Route::of::<AddRequest>().as_str(), "AddRequest");
        assert_eq!(
            Route::name("").into_validated(),
            Err(RegistrationError::EmptyInterface)
        );
    }
}
