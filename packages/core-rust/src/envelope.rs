//! Request/response envelope shared by every transport.
//!
//! Field names follow the wire contract (`reqService`, `reqInterface`,
//! `mcode`, ...). Envelopes are encoded as named `MsgPack` maps via
//! `rmp_serde::to_vec_named()`, byte fields as `MsgPack` binaries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codes;

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Failure to encode or decode an envelope or typed payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Inbound call envelope.
///
/// `req_interface` is the dispatch key. `req_service` is advisory: proxy
/// rules match on it and it shows up in diagnostics, but local dispatch
/// ignores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub req_service: String,
    #[serde(default)]
    pub req_interface: String,
    #[serde(default, with = "serde_bytes")]
    pub header: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Request {
    /// Creates an envelope with empty header and body.
    #[must_use]
    pub fn new(service: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            req_service: service.into(),
            req_interface: interface.into(),
            header: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Sets the raw header bytes.
    #[must_use]
    pub fn with_header(mut self, header: Vec<u8>) -> Self {
        self.header = header;
        self
    }

    /// Sets the raw body bytes.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serializes the envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes an envelope received from the wire.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if `bytes` is not a valid request envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Outbound result envelope.
///
/// Invariant: `result == true` iff `mcode` is empty. The constructors
/// uphold it; code that builds the struct literally must do the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub result: bool,
    #[serde(default)]
    pub mcode: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Response {
    /// Successful response carrying `body`.
    #[must_use]
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            result: true,
            mcode: String::new(),
            message: String::new(),
            body,
        }
    }

    /// Successful response with no body.
    #[must_use]
    pub fn empty() -> Self {
        Self::ok(Vec::new())
    }

    /// Failed response. An empty `code` is replaced by
    /// [`codes::INTERNAL_ERROR`] so the envelope invariant holds.
    #[must_use]
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut mcode = code.into();
        if mcode.is_empty() {
            mcode = codes::INTERNAL_ERROR.to_string();
        }
        Self {
            result: false,
            mcode,
            message: message.into(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result && self.mcode.is_empty()
    }

    /// Serializes the envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes an envelope received from the wire.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if `bytes` is not a valid response envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// Encodes a typed header/body/response payload.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decodes a typed payload. Empty input yields `T::default()`: an absent
/// payload is the zero message, not a decode error.
///
/// # Errors
///
/// Returns `CodecError::Decode` if `bytes` is non-empty and malformed.
pub fn decode_message<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    Ok(rmp_serde::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
