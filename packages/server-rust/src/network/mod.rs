//! Transport adapters: both feed the same [`crate::service::ServerPipeline`].

pub mod config;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod module;
pub mod shutdown;
pub mod stream;

pub use config::{DatagramConfig, NetworkConfig, StreamConfig};
pub use datagram::{datagram_call, serve_datagram};
pub use error::TransportError;
pub use frame::StreamFrame;
pub use module::{BoundAddrs, RpcServer};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use stream::{serve_stream, StreamConnection};
