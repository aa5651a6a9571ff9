use std::time::Duration;

use meshrpc_core::ErrorCodePrefix;

/// Dispatch-side configuration shared by every transport of one node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier used in logs.
    pub node_id: String,
    /// Prefix for numeric error codes (`"SVC"` renders 400 as `"SVC_400"`).
    pub error_code_prefix: ErrorCodePrefix,
    /// Deadline applied to calls that arrive without one, in milliseconds.
    pub default_call_timeout_ms: u64,
    /// Calls admitted per wall-clock second. 0 disables load shedding.
    pub overload_limit_per_sec: u32,
}

impl ServerConfig {
    #[must_use]
    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            error_code_prefix: ErrorCodePrefix::default(),
            default_call_timeout_ms: 30_000,
            overload_limit_per_sec: 0,
        }
    }
}
