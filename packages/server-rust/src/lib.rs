//! `meshrpc` server and client: handler registry, dispatch with tower
//! middleware, proxy rules, stream/datagram transports and client-side
//! invocation with discovery, round robin and circuit breaking.

pub mod client;
pub mod network;
pub mod service;

pub use client::{Client, ClientConfig, Discovery, Service as RemoteService, StaticDiscovery};
pub use network::{BoundAddrs, NetworkConfig, RpcServer};
pub use service::{build_pipeline, CallContext, Router, ServerConfig, ServerPipeline};
