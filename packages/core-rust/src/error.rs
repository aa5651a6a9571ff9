//! Structured RPC error and the `mcode` conventions.
//!
//! Every failure that crosses a transport boundary is an [`RpcError`]
//! rendered into `{result: false, mcode, message}` by
//! [`RpcError::into_response`]. The code is either a caller-defined stable
//! string or a small integer that is rendered as `"<prefix>_<n>"` with the
//! process's [`ErrorCodePrefix`].

use std::fmt;

use crate::codes;
use crate::envelope::{CodecError, Response};

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Stable caller-defined string, sent verbatim.
    Named(String),
    /// Integer rendered with the process prefix on the wire.
    Numeric(i64),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(code) => f.write_str(code),
            Self::Numeric(n) => write!(f, "{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCodePrefix
// ---------------------------------------------------------------------------

/// Per-process prefix for numeric error codes (e.g. `"SVC"` -> `"SVC_400"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCodePrefix(String);

impl ErrorCodePrefix {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Renders a numeric code. With an empty prefix the bare integer is used.
    #[must_use]
    pub fn format(&self, number: i64) -> String {
        if self.0.is_empty() {
            number.to_string()
        } else {
            format!("{}_{number}", self.0)
        }
    }

    /// Recovers the integer from a code produced by [`Self::format`].
    ///
    /// Returns `None` for codes carrying another prefix or a named code.
    #[must_use]
    pub fn strip(&self, mcode: &str) -> Option<i64> {
        let digits = if self.0.is_empty() {
            mcode
        } else {
            mcode.strip_prefix(self.0.as_str())?.strip_prefix('_')?
        };
        digits.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// RpcError
// ---------------------------------------------------------------------------

/// Structured error carried through dispatch and invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    code: ErrorCode,
    message: String,
}

impl RpcError {
    /// Error with a stable string code.
    #[must_use]
    pub fn named(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Named(code.into()),
            message: message.into(),
        }
    }

    /// Error with a numeric code, rendered with the process prefix.
    #[must_use]
    pub fn numeric(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Numeric(code),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn method_not_found(interface: &str) -> Self {
        Self::named(
            codes::METHOD_NOT_FOUND,
            format!("method not found: {interface:?}"),
        )
    }

    #[must_use]
    pub fn bad_header(err: &CodecError) -> Self {
        Self::named(codes::BAD_HEADER, err.to_string())
    }

    #[must_use]
    pub fn bad_body(err: &CodecError) -> Self {
        Self::named(codes::BAD_BODY, err.to_string())
    }

    #[must_use]
    pub fn internal() -> Self {
        Self::named(codes::INTERNAL_ERROR, "internal server error")
    }

    #[must_use]
    pub fn overloaded() -> Self {
        Self::named(codes::OVERLOADED, "server overloaded, try again later")
    }

    #[must_use]
    pub fn code(&self) -> &ErrorCode {
        &self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this error carries the named code `code`.
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        matches!(&self.code, ErrorCode::Named(c) if c == code)
    }

    /// Wire `mcode` for this error.
    #[must_use]
    pub fn mcode(&self, prefix: &ErrorCodePrefix) -> String {
        match &self.code {
            ErrorCode::Named(code) => code.clone(),
            ErrorCode::Numeric(n) => prefix.format(*n),
        }
    }

    /// Converts into a failed envelope.
    #[must_use]
    pub fn into_response(self, prefix: &ErrorCodePrefix) -> Response {
        let mcode = self.mcode(prefix);
        Response::failure(mcode, self.message)
    }

    /// Rebuilds an error from a failed envelope, passing the remote code
    /// through verbatim.
    #[must_use]
    pub fn from_response(response: &Response) -> Self {
        let code = if response.mcode.is_empty() {
            codes::INTERNAL_ERROR.to_string()
        } else {
            response.mcode.clone()
        };
        Self::named(code, response.message.clone())
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::numeric(codes::GENERIC_ERROR_NUMBER, format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_code_uses_prefix() {
        let prefix = ErrorCodePrefix::new("SVC");
        let resp = RpcError::numeric(400, "bad").into_response(&prefix);
        assert!(!resp.result);
        assert_eq!(resp.mcode, "SVC_400");
        assert_eq!(resp.message, "bad");
    }

    #[test]
    fn named_code_ignores_prefix() {
        let prefix = ErrorCodePrefix::new("SVC");
        let err = RpcError::named("ACCOUNT_LOCKED", "locked");
        assert_eq!(err.mcode(&prefix), "ACCOUNT_LOCKED");
    }

    #[test]
    fn empty_prefix_renders_bare_number() {
        assert_eq!(ErrorCodePrefix::default().format(7), "7");
    }

    #[test]
    fn strip_recovers_number() {
        let prefix = ErrorCodePrefix::new("SVC");
        assert_eq!(prefix.strip("SVC_400"), Some(400));
        assert_eq!(prefix.strip("SVC_-3"), Some(-3));
        assert_eq!(prefix.strip("OTHER_400"), None);
        assert_eq!(prefix.strip("SVC400"), None);
        assert_eq!(prefix.strip("SVC_abc"), None);
    }

    #[test]
    fn anyhow_error_becomes_generic_numeric() {
        let err: RpcError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.code(), &ErrorCode::Numeric(codes::GENERIC_ERROR_NUMBER));
        assert_eq!(err.message(), "disk full");
    }

    #[test]
    fn from_response_passes_code_through() {
        let resp = Response::failure("REMOTE_42", "nope");
        let err = RpcError::from_response(&resp);
        assert!(err.has_code("REMOTE_42"));
        assert_eq!(err.message(), "nope");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = RpcError::numeric(12, "oops");
        assert_eq!(err.to_string(), "[12] oops");
    }
}
