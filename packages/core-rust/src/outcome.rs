//! Handler result shapes and how each maps onto a response envelope.

use crate::envelope::{encode_message, Response};
use crate::error::RpcError;
use crate::message::RpcResponse;

/// Role of one handler output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputRole {
    TypedResponse,
    Error,
    RawEnvelopeResponse,
}

/// A handler result shape that maps onto a response envelope.
pub trait IntoOutcome: Send + 'static {
    const OUTPUTS: &'static [OutputRole];

    /// Converts the handler's output into a response or a structured error.
    ///
    /// # Errors
    ///
    /// Returns the handler's own error, or `INTERNAL_ERROR` if a typed
    /// response cannot be encoded.
    fn into_outcome(self) -> Result<Response, RpcError>;
}

fn typed_body<R: RpcResponse>(value: &R) -> Result<Response, RpcError> {
    match encode_message(value) {
        Ok(body) => Ok(Response::ok(body)),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode handler response");
            Err(RpcError::internal())
        }
    }
}

impl IntoOutcome for () {
    const OUTPUTS: &'static [OutputRole] = &[];

    fn into_outcome(self) -> Result<Response, RpcError> {
        Ok(Response::empty())
    }
}

impl IntoOutcome for Response {
    const OUTPUTS: &'static [OutputRole] = &[OutputRole::RawEnvelopeResponse];

    fn into_outcome(self) -> Result<Response, RpcError> {
        Ok(self)
    }
}

impl<E> IntoOutcome for Result<(), E>
where
    E: Into<RpcError> + Send + 'static,
{
    const OUTPUTS: &'static [OutputRole] = &[OutputRole::Error];

    fn into_outcome(self) -> Result<Response, RpcError> {
        self.map(|()| Response::empty()).map_err(Into::into)
    }
}

impl<R, E> IntoOutcome for Result<R, E>
where
    R: RpcResponse,
    E: Into<RpcError> + Send + 'static,
{
    const OUTPUTS: &'static [OutputRole] = &[OutputRole::TypedResponse, OutputRole::Error];

    fn into_outcome(self) -> Result<Response, RpcError> {
        typed_body(&self.map_err(Into::into)?)
    }
}

/// `None` is an empty success envelope.
impl<R, E> IntoOutcome for Result<Option<R>, E>
where
    R: RpcResponse,
    E: Into<RpcError> + Send + 'static,
{
    const OUTPUTS: &'static [OutputRole] = &[OutputRole::TypedResponse, OutputRole::Error];

    fn into_outcome(self) -> Result<Response, RpcError> {
        match self.map_err(Into::into)? {
            Some(value) => typed_body(&value),
            None => Ok(Response::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::codes;
    use crate::envelope::decode_message;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Total {
        sum: i64,
    }
    impl RpcResponse for Total {}

    #[test]
    fn bare_and_optional_typed_results_encode_the_same() {
        let bare: Result<Total, RpcError> = Ok(Total { sum: 7 });
        let wrapped: Result<Option<Total>, RpcError> = Ok(Some(Total { sum: 7 }));
        let bare = bare.into_outcome().unwrap();
        assert_eq!(bare, wrapped.into_outcome().unwrap());
        assert_eq!(decode_message::<Total>(&bare.body).unwrap(), Total { sum: 7 });
        assert_eq!(
            <Result<Total, RpcError> as IntoOutcome>::OUTPUTS,
            &[OutputRole::TypedResponse, OutputRole::Error]
        );
    }

    #[test]
    fn errors_pass_through_every_shape() {
        let bare: Result<Total, RpcError> = Err(RpcError::named(codes::BAD_BODY, "bad"));
        assert!(bare.into_outcome().unwrap_err().has_code(codes::BAD_BODY));

        let unit: Result<(), anyhow::Error> = Err(anyhow::anyhow!("broken"));
        let err = unit.into_outcome().unwrap_err();
        assert_eq!(err.code(), &crate::ErrorCode::Numeric(codes::GENERIC_ERROR_NUMBER));
    }

    #[test]
    fn empty_shapes_are_empty_success() {
        assert_eq!(().into_outcome().unwrap(), Response::empty());
        let none: Result<Option<Total>, RpcError> = Ok(None);
        assert_eq!(none.into_outcome().unwrap(), Response::empty());
    }
}
