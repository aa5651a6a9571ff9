//! `meshrpc` core: the request/response envelope, its wire codec, structured
//! errors with the `mcode` conventions, typed message roles and handler
//! result shapes.

pub mod codes;
pub mod envelope;
pub mod error;
pub mod message;
pub mod outcome;

pub use envelope::{decode_message, encode_message, CodecError, Request, Response};
pub use error::{ErrorCode, ErrorCodePrefix, RpcError};
pub use message::{short_type_name, Message, RpcHeader, RpcRequest, RpcResponse};
pub use outcome::{IntoOutcome, OutputRole};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
