use meshrpc_core::CodecError;

/// Failure of one transport exchange, before any envelope came back.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("deadline exceeded")]
    Timeout,
    #[error("call cancelled")]
    Cancelled,
    #[error("connection closed")]
    Closed,
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl TransportError {
    /// Deadline expiry and context cancellation are reported as timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }
}
