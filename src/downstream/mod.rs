//! Downstream side: sessions and connections to the servers being aggregated.
//!
//! This module handles:
//! - JSON-RPC 2.0 framing and request/response correlation
//! - stdio, Streamable HTTP, and legacy SSE sessions
//! - Connection establishment with bounded retry and the MCP handshake
//! - Capability listing (with pagination) and invocation forwarding
//!
//! The [`Proxy`](crate::proxy::Proxy) owns one [`DownstreamConnection`] per
//! configured server and routes outward requests through them.

pub mod connection;
pub mod errors;
pub mod http;
pub mod session;
pub mod sse;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use connection::{ConnectionOptions, ConnectionState, DownstreamConnection, RetryPolicy};
pub use errors::ProxyError;
pub use session::{Session, SessionFactory, TransportFactory};
pub use types::{
    Capability, CapabilityKind, DownstreamEvent, DownstreamEventKind, Prompt, Resource,
    ResourceTemplate, Tool,
};
