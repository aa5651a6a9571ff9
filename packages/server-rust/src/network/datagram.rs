//! Connectionless transport over UDP.
//!
//! A call is one datagram holding an encoded request, answered by one
//! datagram holding the encoded response. There is no retry: a lost datagram
//! surfaces as a timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshrpc_core::{codes, Request, Response};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::config::DatagramConfig;
use super::error::TransportError;
use super::shutdown::ShutdownController;
use crate::service::{CallContext, ServerPipeline};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Receives datagrams until shutdown is triggered; each one is handled on
/// its own task.
pub async fn serve_datagram(
    socket: UdpSocket,
    pipeline: ServerPipeline,
    config: DatagramConfig,
    shutdown: Arc<ShutdownController>,
) {
    let socket = Arc::new(socket);
    let call_ids = AtomicU64::new(1);
    let mut buf = vec![0u8; config.max_datagram_size];
    if let Ok(addr) = socket.local_addr() {
        info!(%addr, "datagram transport listening");
    }

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            () = shutdown.triggered() => break,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(err) => {
                // ICMP errors from earlier replies surface here on some platforms.
                debug!(error = %err, "datagram receive failed");
                continue;
            }
        };

        let datagram = buf[..len].to_vec();
        let guard = shutdown.in_flight_guard();
        let call_id = call_ids.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::clone(&socket);
        let pipeline = pipeline.clone();
        let limit = config.max_datagram_size;
        tokio::spawn(async move {
            let _guard = guard;
            let response = match Request::decode(&datagram) {
                Ok(request) => {
                    let ctx = CallContext::new().with_call_id(call_id).with_peer(peer);
                    pipeline.handle(ctx, request).await
                }
                Err(err) => Response::failure(codes::BAD_ENVELOPE, err.to_string()),
            };
            if let Err(err) = reply(&socket, peer, &response, limit).await {
                warn!(%peer, error = %err, "datagram reply failed");
            }
        });
    }
    info!("datagram transport stopped receiving");
}

async fn reply(
    socket: &UdpSocket,
    peer: SocketAddr,
    response: &Response,
    limit: usize,
) -> Result<(), TransportError> {
    let mut bytes = response.encode()?;
    if bytes.len() > limit {
        let size = bytes.len();
        bytes = Response::failure(
            codes::UDP_ERROR,
            format!("response of {size} bytes exceeds datagram limit of {limit}"),
        )
        .encode()?;
    }
    socket.send_to(&bytes, peer).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sends `request` to `endpoint` from a fresh ephemeral socket and waits for
/// the single reply.
///
/// Without a context deadline the config's `default_timeout` applies.
///
/// # Errors
///
/// `PayloadTooLarge` if the encoded request does not fit one datagram,
/// `Timeout` if no reply arrives in time, `Cancelled` when the context is
/// cancelled, `Io`/`Codec` for socket or decode failures.
pub async fn datagram_call(
    ctx: &CallContext,
    endpoint: &str,
    request: &Request,
    config: &DatagramConfig,
) -> Result<Response, TransportError> {
    let payload = request.encode()?;
    if payload.len() > config.max_datagram_size {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            limit: config.max_datagram_size,
        });
    }

    let ctx = if ctx.deadline().is_some() {
        ctx.clone()
    } else {
        ctx.clone().with_timeout(config.default_timeout)
    };

    let exchange = async {
        let target = tokio::net::lookup_host(endpoint)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, endpoint.to_string()))?;
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        socket.send(&payload).await?;

        let mut buf = vec![0u8; config.max_datagram_size];
        let len = socket.recv(&mut buf).await?;
        Ok::<_, TransportError>(Response::decode(&buf[..len])?)
    };

    tokio::select! {
        result = exchange => result,
        () = ctx.expired() => Err(TransportError::Timeout),
        () = ctx.cancelled() => Err(TransportError::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
