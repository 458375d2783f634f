//! Proxy error types.

use thiserror::Error;

use super::connection::ConnectionState;
use super::types::{error_codes, CapabilityKind, JsonRpcError};
use crate::proxy::LifecycleState;

/// Errors produced anywhere in the aggregation proxy.
///
/// The first five variants are the routing taxonomy callers reason about; the
/// rest are transport-level causes that connection code folds into them.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Malformed configuration, rejected before any connection attempt.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },

    /// Connection establishment failed after every retry.
    #[error("failed to connect to '{server}' after {attempts} attempt(s): {reason}")]
    Connection {
        server: String,
        attempts: u32,
        reason: String,
    },

    /// Invocation attempted against a connection that is not `Connected`.
    #[error("server '{server}' is unavailable ({state})")]
    UpstreamUnavailable {
        server: String,
        state: ConnectionState,
    },

    /// The downstream server answered with an application error.
    #[error("[{server}] {message}")]
    Upstream {
        server: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// External identifier absent from the routing table.
    #[error("{kind} not found: '{id}'")]
    NotFound {
        kind: CapabilityKind,
        id: String,
    },

    /// Topology operation named a server the proxy does not have.
    #[error("no server named '{name}'")]
    UnknownServer {
        name: String,
    },

    /// Outward request for a method the proxy does not serve.
    #[error("method not found: {method}")]
    MethodNotFound {
        method: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// I/O or framing failure on a downstream session.
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Raw JSON-RPC error response, before it is tagged with a server name.
    #[error("server error [{code}]: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A downstream request did not answer in time.
    #[error("request '{method}' to '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Inbound request parameters did not have the expected shape.
    #[error("invalid params: {reason}")]
    InvalidParams {
        reason: String,
    },

    /// Shutdown interrupted the operation.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Operation not allowed in the proxy's current lifecycle state.
    #[error("operation not allowed while proxy is {state}")]
    InvalidState {
        state: LifecycleState,
    },

    /// Strict connect policy: at least one downstream failed.
    #[error("{} server(s) failed to connect: {}", .failures.len(), summarize(.failures))]
    StartupFailed {
        failures: Vec<(String, String)>,
    },
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(server, reason)| format!("{server}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ProxyError {
    /// Attach a server name to an untagged RPC error.
    ///
    /// Already-tagged variants pass through unchanged.
    pub fn tagged(self, server: &str) -> Self {
        match self {
            Self::Rpc {
                code,
                message,
                data,
            } => Self::Upstream {
                server: server.to_string(),
                code,
                message,
                data,
            },
            other => other,
        }
    }

    /// Translate into the JSON-RPC error object sent to outward clients.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        let (code, data) = match self {
            Self::NotFound {
                kind: CapabilityKind::Resource | CapabilityKind::ResourceTemplate,
                ..
            } => (error_codes::RESOURCE_NOT_FOUND, None),
            Self::NotFound { .. } | Self::InvalidParams { .. } | Self::UnknownServer { .. } => {
                (error_codes::INVALID_PARAMS, None)
            }
            Self::MethodNotFound { .. } => (error_codes::METHOD_NOT_FOUND, None),
            Self::Upstream { code, data, .. } | Self::Rpc { code, data, .. } => {
                (*code, data.clone())
            }
            _ => (error_codes::INTERNAL_ERROR, None),
        };
        JsonRpcError {
            code,
            message: self.to_string(),
            data,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
