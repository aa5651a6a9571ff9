//! Server-side call handling.
//!
//! 1. **Binding** (`binding`): typed handlers adapted to envelopes at registration
//! 2. **Groups** (`group`): nested pre-processing chains
//! 3. **Proxy** (`proxy`): forwarding rules for calls with no local handler
//! 4. **Routing** (`router`): interface lookup and dispatch
//! 5. **Middleware** (`middleware`): Tower layers (metrics, logging, load shedding, timeout, recovery)
//! 6. **Background workers** (`worker`): periodic tasks

pub mod binding;
pub mod config;
pub mod context;
pub mod group;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod worker;

pub use binding::{
    Body, CallBinding, CallParts, FromCall, Handler, Header, IntoOutcome, OutputRole, ParamRole, RawRequest,
    RegistrationError, Route,
};
pub use config::ServerConfig;
pub use context::{CallContext, RpcCall};
pub use group::{pre_process_fn, GroupId, PreProcess};
pub use middleware::{build_pipeline, ServerPipeline};
pub use proxy::{
    match_interface, match_service, match_service_interfaces, match_service_where, resolve_failed,
    resolve_fn, Forwarder, Matcher, ProxyResolver, ProxyTarget, StaticResolver,
};
pub use router::{DispatchService, GroupHandle, Router};
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerError};
