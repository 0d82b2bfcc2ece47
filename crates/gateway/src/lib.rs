//! HTTP front end of the proxy.
//!
//! A request to `POST /v1/{tenant}/chat/completions` passes the auth hooks,
//! has its attachments ingested into the tenant's document index, picks up
//! relevant memories and document excerpts, and is forwarded upstream. The
//! reply is relayed (buffered or as SSE) and the exchange is written back to
//! tenant memory afterwards.

pub mod context;
pub mod error;
pub mod hooks;
pub mod ingest;
pub mod normalize;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod state;

pub use {
    error::ProxyError,
    proxy::{BrainProxy, ProxyResponse, ProxySettings},
    server::{build_app, start_server},
    state::{AppState, build_hooks, build_proxy, build_proxy_with_hooks},
};
