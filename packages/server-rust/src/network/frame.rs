//! Stream transport framing.
//!
//! Each length-delimited frame carries one `MsgPack` [`StreamFrame`]. The
//! frame id pairs a reply with its call so many calls can share one socket.

use bytes::Bytes;
use meshrpc_core::CodecError;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    pub id: u64,
    /// Remaining caller deadline in milliseconds; 0 when the caller set none.
    #[serde(default)]
    pub timeout_ms: u64,
    /// Encoded request or response envelope.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl StreamFrame {
    #[must_use]
    pub fn new(id: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            timeout_ms: 0,
            payload,
        }
    }

    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    /// # Errors
    ///
    /// Returns `CodecError::Decode` if `bytes` is not a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Length-delimited codec with the configured frame limit.
#[must_use]
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}
