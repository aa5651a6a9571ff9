//! Per-call context threaded through dispatch, handlers and outbound calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use meshrpc_core::Request;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Context carried with every call.
///
/// Clones share the same cancellation token. Use [`CallContext::child`] to
/// derive a context whose cancellation does not propagate upwards.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Transport-assigned identifier (stream frame id or datagram sequence).
    pub call_id: u64,
    /// Trace identifier for log correlation.
    pub trace_id: String,
    /// Remote address of the caller, when the call arrived over a socket.
    pub peer: Option<SocketAddr>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    values: BTreeMap<String, String>,
}

impl CallContext {
    /// Fresh context with a random trace id, no deadline and no peer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            call_id: 0,
            trace_id: uuid::Uuid::new_v4().to_string(),
            peer: None,
            deadline: None,
            cancel: CancellationToken::new(),
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_call_id(mut self, call_id: u64) -> Self {
        self.call_id = call_id;
        self
    }

    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Sets the deadline to `timeout` from now, keeping an earlier deadline
    /// if one is already set.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Derives a context whose token is a child of this one: cancelling the
    /// parent cancels the child, cancelling the child leaves the parent alone.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            call_id: self.call_id,
            trace_id: self.trace_id.clone(),
            peer: self.peer,
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            values: self.values.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + '_ {
        self.cancel.cancelled()
    }

    /// Resolves when the deadline passes; never resolves without a deadline.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Attaches a string value, typically from a pre-processing step.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit of work flowing through the server middleware stack.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub ctx: CallContext,
    pub request: Request,
}

impl RpcCall {
    #[must_use]
    pub fn new(ctx: CallContext, request: Request) -> Self {
        Self { ctx, request }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cancellation_does_not_reach_parent() {
        let parent = CallContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_child_and_clones() {
        let parent = CallContext::new();
        let child = parent.child();
        let clone = parent.clone();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_keeps_earliest_deadline() {
        let ctx = CallContext::new()
            .with_timeout(Duration::from_millis(100))
            .with_timeout(Duration::from_secs(10));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_resolves_at_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        ctx.expired().await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn values_round_trip() {
        let mut ctx = CallContext::new();
        ctx.set_value("tenant", "t-1");
        assert_eq!(ctx.value("tenant"), Some("t-1"));
        assert_eq!(ctx.value("missing"), None);
    }
}
