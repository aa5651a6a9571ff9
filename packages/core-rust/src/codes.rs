//! Stable `mcode` strings shared by servers and clients.
//!
//! Transport codes for the connection-oriented transport keep the `GRPC_`
//! label: existing callers match on these strings.

/// No local handler and no proxy rule accepted the request.
pub const METHOD_NOT_FOUND: &str = "GRPC_METHOD_NOTFOUND";
/// Header bytes did not decode into the handler's header type.
pub const BAD_HEADER: &str = "BAD_HEADER";
/// Body bytes did not decode into the handler's body type.
pub const BAD_BODY: &str = "BAD_BODY";
/// The frame or datagram did not decode into a request envelope.
pub const BAD_ENVELOPE: &str = "BAD_ENVELOPE";
/// Unrecovered failure inside the server. Details stay in the server log.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Rejected by overload shedding before the handler ran.
pub const OVERLOADED: &str = "OVERLOADED";
/// Server-side call deadline expired while the handler was running.
pub const CALL_TIMEOUT: &str = "CALL_TIMEOUT";
/// A proxy rule matched but its resolver could not produce a target.
pub const PROXY_RESOLVE_FAILED: &str = "PROXY_RESOLVE_FAILED";
/// Service discovery failed or returned no endpoints.
pub const DISCOVERY_FAILED: &str = "DISCOVERY_FAILED";

pub const GRPC_TIMEOUT: &str = "GRPC_TIMEOUT";
pub const GRPC_ERROR: &str = "GRPC_ERROR";
pub const UDP_TIMEOUT: &str = "UDP_TIMEOUT";
pub const UDP_ERROR: &str = "UDP_ERROR";

/// Numeric code used when a generic error reaches the envelope boundary.
pub const GENERIC_ERROR_NUMBER: i64 = 500;
