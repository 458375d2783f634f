//! Shared types for downstream sessions.
//!
//! JSON-RPC 2.0 message types and the MCP capability shapes the proxy routes.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Build a success response for an arbitrary request id.
pub fn response_ok(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response for an arbitrary request id.
pub fn response_err(id: Value, error: &JsonRpcError) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// A message read off a session, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Answer to a request we sent.
    Response(JsonRpcResponse),
    /// Peer-initiated notification.
    Notification { method: String, params: Option<Value> },
    /// Peer-initiated request that expects an answer.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Anything else (log noise, malformed frames, batches).
    Invalid,
}

impl IncomingMessage {
    /// Classify a decoded JSON value.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut obj) = value else {
            return Self::Invalid;
        };
        let params = obj.remove("params");
        match (obj.remove("method"), obj.remove("id")) {
            (Some(Value::String(method)), None) => Self::Notification { method, params },
            (Some(Value::String(method)), Some(id)) => Self::Request { id, method, params },
            (None, Some(id)) => {
                obj.insert("id".into(), id);
                serde_json::from_value(Value::Object(obj))
                    .map(Self::Response)
                    .unwrap_or(Self::Invalid)
            }
            _ => Self::Invalid,
        }
    }

    /// Parse and classify one text frame.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str::<Value>(text)
            .map(Self::classify)
            .unwrap_or(Self::Invalid)
    }
}

// ─── MCP Capabilities ────────────────────────────────────────────────────────

/// The four independently-namespaced capability kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
    ResourceTemplate,
}

impl CapabilityKind {
    /// JSON-RPC method that lists this kind.
    pub fn list_method(self) -> &'static str {
        match self {
            Self::Tool => "tools/list",
            Self::Resource => "resources/list",
            Self::Prompt => "prompts/list",
            Self::ResourceTemplate => "resources/templates/list",
        }
    }

    /// Key holding the items in a list result.
    pub fn list_key(self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Resource => "resources",
            Self::Prompt => "prompts",
            Self::ResourceTemplate => "resourceTemplates",
        }
    }

    /// Key in a server's `capabilities` object that advertises this kind.
    pub fn capability_key(self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Resource | Self::ResourceTemplate => "resources",
            Self::Prompt => "prompts",
        }
    }

    /// Outward `list_changed` notification for this kind.
    ///
    /// Templates share the resources notification.
    pub fn list_changed_method(self) -> &'static str {
        match self {
            Self::Tool => "notifications/tools/list_changed",
            Self::Resource | Self::ResourceTemplate => "notifications/resources/list_changed",
            Self::Prompt => "notifications/prompts/list_changed",
        }
    }

    /// Whether identifiers of this kind are URIs rather than names.
    pub fn is_uri(self) -> bool {
        matches!(self, Self::Resource | Self::ResourceTemplate)
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
            Self::ResourceTemplate => "resource template",
        })
    }
}

/// An item the aggregator can route: it has one identifier that may be rewritten.
///
/// Everything except the identifier is carried through untouched.
pub trait Capability: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: CapabilityKind;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);
}

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// MCP resource as returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// MCP prompt as returned by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// MCP resource template as returned by `resources/templates/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

macro_rules! impl_capability {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl Capability for $ty {
            const KIND: CapabilityKind = $kind;

            fn id(&self) -> &str {
                &self.$field
            }

            fn set_id(&mut self, id: String) {
                self.$field = id;
            }
        }
    };
}

impl_capability!(Tool, CapabilityKind::Tool, name);
impl_capability!(Resource, CapabilityKind::Resource, uri);
impl_capability!(Prompt, CapabilityKind::Prompt, name);
impl_capability!(ResourceTemplate, CapabilityKind::ResourceTemplate, uri_template);

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Whether the server advertised support for a capability kind.
    pub fn supports(&self, kind: CapabilityKind) -> bool {
        self.capabilities
            .get(kind.capability_key())
            .is_some_and(|v| !v.is_null())
    }

    /// Whether the server accepts `resources/subscribe`.
    pub fn supports_subscribe(&self) -> bool {
        self.capabilities
            .get("resources")
            .and_then(|r| r.get("subscribe"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Downstream Events ───────────────────────────────────────────────────────

/// Something a downstream session reported outside a request/response pair.
#[derive(Debug, Clone)]
pub struct DownstreamEvent {
    pub server: String,
    pub kind: DownstreamEventKind,
}

#[derive(Debug, Clone)]
pub enum DownstreamEventKind {
    Notification { method: String, params: Option<Value> },
    /// The session ended on its own (process exit, stream end).
    Closed { reason: String },
}

/// Channel every session reports its events on.
pub type EventSink = mpsc::UnboundedSender<DownstreamEvent>;

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Resource not found (MCP).
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
