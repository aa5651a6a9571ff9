//! Connection-oriented transport over TCP.
//!
//! Server side: one reader per connection, one task per call, and a single
//! writer per connection fed by a bounded channel. Client side:
//! [`StreamConnection`] multiplexes concurrent calls over one socket and
//! pairs replies with calls by frame id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meshrpc_core::{codes, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::StreamConfig;
use super::error::TransportError;
use super::frame::{frame_codec, StreamFrame};
use super::shutdown::ShutdownController;
use crate::service::{CallContext, ServerPipeline};

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accepts connections until shutdown is triggered.
///
/// Connections already accepted keep answering the calls they have read;
/// they stop reading new frames once shutdown is triggered.
pub async fn serve_stream(
    listener: TcpListener,
    pipeline: ServerPipeline,
    config: StreamConfig,
    shutdown: Arc<ShutdownController>,
) {
    let call_ids = Arc::new(AtomicU64::new(1));
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "stream transport listening");
    }

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = shutdown.triggered() => break,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!(%peer, "stream connection accepted");
                tokio::spawn(serve_connection(
                    socket,
                    peer,
                    pipeline.clone(),
                    config.clone(),
                    Arc::clone(&shutdown),
                    Arc::clone(&call_ids),
                ));
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
    info!("stream transport stopped accepting");
}

async fn serve_connection(
    socket: TcpStream,
    peer: SocketAddr,
    pipeline: ServerPipeline,
    config: StreamConfig,
    shutdown: Arc<ShutdownController>,
    call_ids: Arc<AtomicU64>,
) {
    if let Err(err) = socket.set_nodelay(true) {
        debug!(%peer, error = %err, "set_nodelay failed");
    }
    let (sink, mut frames) = Framed::new(socket, frame_codec(config.max_frame_length)).split();
    let (tx, rx) = mpsc::channel::<Bytes>(config.outbound_channel_capacity);
    let writer = tokio::spawn(write_frames(sink, rx, CancellationToken::new()));

    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            () = shutdown.triggered() => break,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                debug!(%peer, error = %err, "stream read failed");
                break;
            }
            None => break,
        };
        let frame = match StreamFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%peer, error = %err, "undecodable frame, closing connection");
                break;
            }
        };

        let guard = shutdown.in_flight_guard();
        let call_id = call_ids.fetch_add(1, Ordering::Relaxed);
        let pipeline = pipeline.clone();
        let tx = tx.clone();
        let max_frame_length = config.max_frame_length;
        tokio::spawn(async move {
            let _guard = guard;
            let response = match Request::decode(&frame.payload) {
                Ok(request) => {
                    let mut ctx = CallContext::new().with_call_id(call_id).with_peer(peer);
                    if frame.timeout_ms > 0 {
                        ctx = ctx.with_timeout(Duration::from_millis(frame.timeout_ms));
                    }
                    pipeline.handle(ctx, request).await
                }
                Err(err) => Response::failure(codes::BAD_ENVELOPE, err.to_string()),
            };
            match encode_reply(frame.id, &response, max_frame_length) {
                Ok(reply) => {
                    if tx.send(reply).await.is_err() {
                        debug!(%peer, "connection closed before reply was written");
                    }
                }
                Err(err) => warn!(%peer, error = %err, "reply encoding failed"),
            }
        });
    }

    // The writer exits once every call task has dropped its sender.
    drop(tx);
    if let Err(err) = writer.await {
        warn!(%peer, error = %err, "stream writer ended abnormally");
    }
    debug!(%peer, "stream connection closed");
}

/// Encodes a reply frame, replacing a reply that would exceed the frame
/// limit with a failure envelope.
fn encode_reply(
    id: u64,
    response: &Response,
    max_frame_length: usize,
) -> Result<Bytes, TransportError> {
    let frame = StreamFrame::new(id, response.encode()?).encode()?;
    if frame.len() <= max_frame_length {
        return Ok(frame);
    }
    let fallback = Response::failure(
        codes::INTERNAL_ERROR,
        format!("response of {} bytes exceeds frame limit", frame.len()),
    );
    Ok(StreamFrame::new(id, fallback.encode()?).encode()?)
}

async fn write_frames(mut sink: FrameSink, mut rx: mpsc::Receiver<Bytes>, closed: CancellationToken) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            () = closed.cancelled() => None,
        };
        let Some(frame) = frame else { break };
        if let Err(err) = sink.send(frame).await {
            debug!(error = %err, "stream write failed");
            break;
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type Pending = DashMap<u64, oneshot::Sender<Response>>;

/// One client socket shared by concurrent calls.
#[derive(Debug)]
pub struct StreamConnection {
    endpoint: String,
    tx: mpsc::Sender<Bytes>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    closed: CancellationToken,
    max_frame_length: usize,
}

impl StreamConnection {
    /// Connects and spawns the connection's reader and writer.
    ///
    /// # Errors
    ///
    /// `TransportError::Connect` if the endpoint refuses or cannot be
    /// resolved, `TransportError::Timeout` if connecting takes longer than
    /// `connect_timeout`.
    pub async fn connect(endpoint: &str, config: &StreamConfig) -> Result<Self, TransportError> {
        let socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        socket.set_nodelay(true)?;

        let (sink, frames) = Framed::new(socket, frame_codec(config.max_frame_length)).split();
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let pending = Arc::new(Pending::new());
        let closed = CancellationToken::new();

        tokio::spawn(write_frames(sink, rx, closed.clone()));
        tokio::spawn(read_replies(frames, Arc::clone(&pending), closed.clone()));
        debug!(endpoint, "stream connection established");

        Ok(Self {
            endpoint: endpoint.to_string(),
            tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            max_frame_length: config.max_frame_length,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Sends one request and waits for its reply.
    ///
    /// The remaining context deadline travels with the frame so the server
    /// applies the same budget.
    ///
    /// # Errors
    ///
    /// `Timeout` when the context deadline passes, `Cancelled` when the
    /// context is cancelled, `Closed` when the connection drops first.
    pub async fn call(&self, ctx: &CallContext, request: &Request) -> Result<Response, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = StreamFrame::new(id, request.encode()?);
        if let Some(remaining) = ctx.remaining() {
            let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
            frame.timeout_ms = millis.max(1);
        }
        let bytes = frame.encode()?;
        if bytes.len() > self.max_frame_length {
            return Err(TransportError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_frame_length,
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        let _pending = PendingSlot {
            pending: &self.pending,
            id,
        };

        let exchange = async {
            self.tx.send(bytes).await.map_err(|_| TransportError::Closed)?;
            reply_rx.await.map_err(|_| TransportError::Closed)
        };
        tokio::select! {
            result = exchange => result,
            () = ctx.expired() => Err(TransportError::Timeout),
            () = ctx.cancelled() => Err(TransportError::Cancelled),
        }
    }

    /// Stops the reader and writer; waiting calls fail with `Closed`.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Removes an abandoned call's slot when the caller stops waiting.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn read_replies(mut frames: FrameStream, pending: Arc<Pending>, closed: CancellationToken) {
    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            () = closed.cancelled() => break,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                debug!(error = %err, "stream read failed");
                break;
            }
            None => break,
        };
        let reply = StreamFrame::decode(&bytes)
            .and_then(|frame| Response::decode(&frame.payload).map(|resp| (frame.id, resp)));
        match reply {
            Ok((id, response)) => match pending.remove(&id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response);
                }
                None => debug!(id, "reply for abandoned call"),
            },
            Err(err) => {
                warn!(error = %err, "undecodable reply, closing connection");
                break;
            }
        }
    }
    closed.cancel();
    pending.clear();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use meshrpc_core::{decode_message, encode_message, ErrorCodePrefix, RpcError, RpcRequest, RpcResponse};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::service::{build_pipeline, Body, Router, ServerConfig};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct SleepRequest {
        millis: u64,
    }
    impl RpcRequest for SleepRequest {}

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct SleepResponse {
        slept: u64,
    }
    impl RpcResponse for SleepResponse {}

    async fn sleep(Body(req): Body<SleepRequest>) -> Result<Option<SleepResponse>, RpcError> {
        tokio::time::sleep(Duration::from_millis(req.millis)).await;
        Ok(Some(SleepResponse { slept: req.millis }))
    }

    async fn start_server() -> (SocketAddr, Arc<ShutdownController>) {
        let router = Router::new();
        router.register("Sleep", sleep).unwrap();
        let config = ServerConfig {
            error_code_prefix: ErrorCodePrefix::new("SVC"),
            ..ServerConfig::default()
        };
        let pipeline = build_pipeline(Arc::new(router), &config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(ShutdownController::new());
        tokio::spawn(serve_stream(
            listener,
            pipeline,
            StreamConfig::default(),
            Arc::clone(&shutdown),
        ));
        (addr, shutdown)
    }

    fn sleep_request(millis: u64) -> Request {
        Request::new("demo", "Sleep").with_body(encode_message(&SleepRequest { millis }).unwrap())
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_connection() {
        let (addr, _shutdown) = start_server().await;
        let conn = Arc::new(
            StreamConnection::connect(&addr.to_string(), &StreamConfig::default())
                .await
                .unwrap(),
        );

        // Replies come back out of order; ids must route each to its caller.
        let calls: Vec<_> = [60, 10, 30]
            .into_iter()
            .map(|millis| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    let resp = conn.call(&CallContext::new(), &sleep_request(millis)).await.unwrap();
                    decode_message::<SleepResponse>(&resp.body).unwrap().slept
                })
            })
            .collect();
        for (call, expected) in calls.into_iter().zip([60, 10, 30]) {
            assert_eq!(call.await.unwrap(), expected);
        }
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_interface_comes_back_as_failure_envelope() {
        let (addr, _shutdown) = start_server().await;
        let conn = StreamConnection::connect(&addr.to_string(), &StreamConfig::default())
            .await
            .unwrap();
        let resp = conn
            .call(&CallContext::new(), &Request::new("demo", "Missing"))
            .await
            .unwrap();
        assert!(!resp.result);
        assert_eq!(resp.mcode, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn client_deadline_reports_timeout_and_frees_slot() {
        let (addr, _shutdown) = start_server().await;
        let conn = StreamConnection::connect(&addr.to_string(), &StreamConfig::default())
            .await
            .unwrap();
        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        let err = conn.call(&ctx, &sleep_request(500)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn connect_refused_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = StreamConnection::connect(&addr.to_string(), &StreamConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn closed_connection_rejects_calls() {
        let (addr, _shutdown) = start_server().await;
        let conn = StreamConnection::connect(&addr.to_string(), &StreamConfig::default())
            .await
            .unwrap();
        conn.close();
        let err = conn.call(&CallContext::new(), &sleep_request(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
