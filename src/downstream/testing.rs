//! In-memory downstream servers for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::connection::PROTOCOL_VERSION;
use super::errors::ProxyError;
use super::session::{Session, SessionFactory};
use super::types::{DownstreamEvent, DownstreamEventKind, EventSink};
use crate::descriptor::ServerSpec;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// What a fake server exposes and how it misbehaves.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
    pub templates: Vec<String>,
    pub failing_tools: HashMap<String, (i32, String)>,
    pub slow_tools: HashSet<String>,
    pub page_size: Option<usize>,
    pub fail_initialize: bool,
    /// Every `*/list` request hangs forever.
    pub hang_lists: bool,
    /// `resources/subscribe` fails after a short delay.
    pub reject_subscribe: bool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str) -> Self {
        self.tools.push(name.to_string());
        self
    }

    pub fn with_resource(mut self, uri: &str) -> Self {
        self.resources.push(uri.to_string());
        self
    }

    pub fn with_prompt(mut self, name: &str) -> Self {
        self.prompts.push(name.to_string());
        self
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.templates.push(template.to_string());
        self
    }

    pub fn with_failing_tool(mut self, name: &str, code: i32, message: &str) -> Self {
        self.tools.push(name.to_string());
        self.failing_tools
            .insert(name.to_string(), (code, message.to_string()));
        self
    }

    /// A tool whose calls never answer.
    pub fn with_slow_tool(mut self, name: &str) -> Self {
        self.tools.push(name.to_string());
        self.slow_tools.insert(name.to_string());
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn rejecting_subscribe(mut self) -> Self {
        self.reject_subscribe = true;
        self
    }

    fn capabilities(&self) -> Value {
        let mut caps = serde_json::Map::new();
        if !self.tools.is_empty() {
            caps.insert("tools".into(), json!({ "listChanged": true }));
        }
        if !self.resources.is_empty() || !self.templates.is_empty() {
            caps.insert(
                "resources".into(),
                json!({ "listChanged": true, "subscribe": true }),
            );
        }
        if !self.prompts.is_empty() {
            caps.insert("prompts".into(), json!({ "listChanged": true }));
        }
        Value::Object(caps)
    }

    fn page(&self, key: &str, items: Vec<Value>, params: Option<&Value>) -> Value {
        let start = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(items.len().max(1));
        let end = (start + size).min(items.len());
        let mut page = serde_json::Map::new();
        page.insert(key.to_string(), Value::Array(items[start.min(end)..end].to_vec()));
        if end < items.len() {
            page.insert("nextCursor".into(), json!(end.to_string()));
        }
        Value::Object(page)
    }
}

/// Everything the fakes observed, keyed by server name.
#[derive(Debug, Default)]
struct FakeLog {
    opens: Mutex<HashMap<String, u32>>,
    closes: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<(String, String, Option<Value>)>>,
}

/// Session backed by a shared [`FakeServer`].
pub struct FakeSession {
    name: String,
    server: Arc<Mutex<FakeServer>>,
    events: EventSink,
    closed: AtomicBool,
    log: Arc<FakeLog>,
}

impl FakeSession {
    /// Simulate the process dying underneath the session.
    pub fn crash(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(DownstreamEvent {
            server: self.name.clone(),
            kind: DownstreamEventKind::Closed {
                reason: "process exited".into(),
            },
        });
    }

    /// Push a server-initiated notification.
    pub fn emit(&self, method: &str, params: Option<Value>) {
        let _ = self.events.send(DownstreamEvent {
            server: self.name.clone(),
            kind: DownstreamEventKind::Notification {
                method: method.to_string(),
                params,
            },
        });
    }

    fn rpc_error(code: i32, message: &str) -> ProxyError {
        ProxyError::Rpc {
            code,
            message: message.to_string(),
            data: None,
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::Transport {
                server: self.name.clone(),
                reason: "session closed".into(),
            });
        }
        lock(&self.log.requests).push((self.name.clone(), method.to_string(), params.clone()));

        let server = lock(&self.server).clone();
        let param = |key: &str| {
            params
                .as_ref()
                .and_then(|p| p.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        if server.hang_lists && method.ends_with("/list") {
            std::future::pending::<()>().await;
        }

        match method {
            "initialize" if server.fail_initialize => {
                Err(Self::rpc_error(-32603, "initialize exploded"))
            }
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": server.capabilities(),
                "serverInfo": { "name": self.name, "version": "0.0.0" },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let items = server
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t,
                            "description": format!("{t} from {}", self.name),
                            "inputSchema": { "type": "object" },
                        })
                    })
                    .collect();
                Ok(server.page("tools", items, params.as_ref()))
            }
            "resources/list" => {
                let items = server
                    .resources
                    .iter()
                    .map(|u| json!({ "uri": u, "name": u }))
                    .collect();
                Ok(server.page("resources", items, params.as_ref()))
            }
            "resources/templates/list" => {
                let items = server
                    .templates
                    .iter()
                    .map(|t| json!({ "uriTemplate": t, "name": t }))
                    .collect();
                Ok(server.page("resourceTemplates", items, params.as_ref()))
            }
            "prompts/list" => {
                let items = server.prompts.iter().map(|p| json!({ "name": p })).collect();
                Ok(server.page("prompts", items, params.as_ref()))
            }
            "tools/call" => {
                let name = param("name");
                if server.slow_tools.contains(&name) {
                    std::future::pending::<()>().await;
                }
                if let Some((code, message)) = server.failing_tools.get(&name) {
                    return Err(Self::rpc_error(*code, message));
                }
                if !server.tools.contains(&name) {
                    return Err(Self::rpc_error(-32602, &format!("unknown tool: {name}")));
                }
                Ok(json!({
                    "content": [{ "type": "text", "text": format!("{}:{name}", self.name) }],
                    "isError": false,
                }))
            }
            "resources/read" => {
                let uri = param("uri");
                Ok(json!({
                    "contents": [{ "uri": uri, "text": format!("{}:{uri}", self.name) }],
                }))
            }
            "prompts/get" => {
                let name = param("name");
                Ok(json!({
                    "description": format!("{}:{name}", self.name),
                    "messages": [],
                }))
            }
            "resources/subscribe" if server.reject_subscribe => {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Err(Self::rpc_error(-32002, "subscriptions are disabled"))
            }
            "resources/subscribe" | "resources/unsubscribe" => Ok(json!({})),
            "completion/complete" => Ok(json!({
                "completion": { "values": [self.name], "hasMore": false },
            })),
            other => Err(Self::rpc_error(-32601, &format!("method not found: {other}"))),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ProxyError> {
        self.closed.store(true, Ordering::SeqCst);
        *lock(&self.log.closes).entry(self.name.clone()).or_default() += 1;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory handing out [`FakeSession`]s, with scripted open failures.
#[derive(Default)]
pub struct FakeFactory {
    servers: Mutex<HashMap<String, Arc<Mutex<FakeServer>>>>,
    failures: Mutex<HashMap<String, u32>>,
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    log: Arc<FakeLog>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_server(self: Arc<Self>, name: &str, server: FakeServer) -> Arc<Self> {
        self.set_server(name, server);
        self
    }

    /// Fail the next `count` opens for `name`.
    pub fn with_failures(self: Arc<Self>, name: &str, count: u32) -> Arc<Self> {
        lock(&self.failures).insert(name.to_string(), count);
        self
    }

    /// Every open for `name` fails.
    pub fn with_unreachable(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.with_failures(name, u32::MAX)
    }

    /// Register or replace a server. Live sessions see the change.
    pub fn set_server(&self, name: &str, server: FakeServer) {
        let mut servers = lock(&self.servers);
        match servers.get(name) {
            Some(existing) => *lock(existing) = server,
            None => {
                servers.insert(name.to_string(), Arc::new(Mutex::new(server)));
            }
        }
    }

    /// Edit a registered server in place.
    pub fn edit_server(&self, name: &str, edit: impl FnOnce(&mut FakeServer)) {
        if let Some(server) = lock(&self.servers).get(name) {
            edit(&mut lock(server));
        }
    }

    /// Most recently opened session for `name`.
    pub fn session(&self, name: &str) -> Option<Arc<FakeSession>> {
        lock(&self.sessions).get(name).cloned()
    }

    pub fn open_count(&self, name: &str) -> u32 {
        lock(&self.log.opens).get(name).copied().unwrap_or(0)
    }

    pub fn close_count(&self, name: &str) -> u32 {
        lock(&self.log.closes).get(name).copied().unwrap_or(0)
    }

    /// Requests received by `name`, as `(method, params)`.
    pub fn requests(&self, name: &str) -> Vec<(String, Option<Value>)> {
        lock(&self.log.requests)
            .iter()
            .filter(|(server, _, _)| server == name)
            .map(|(_, method, params)| (method.clone(), params.clone()))
            .collect()
    }

    pub fn requested(&self, name: &str, method: &str) -> bool {
        self.requests(name).iter().any(|(m, _)| m == method)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(
        &self,
        spec: &ServerSpec,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, ProxyError> {
        *lock(&self.log.opens).entry(spec.name.clone()).or_default() += 1;

        {
            let mut failures = lock(&self.failures);
            if let Some(remaining) = failures.get_mut(&spec.name) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(ProxyError::SpawnFailed {
                        name: spec.name.clone(),
                        reason: "connection refused".into(),
                    });
                }
            }
        }

        let server = lock(&self.servers)
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| ProxyError::SpawnFailed {
                name: spec.name.clone(),
                reason: "no such fake server".into(),
            })?;

        let session = Arc::new(FakeSession {
            name: spec.name.clone(),
            server,
            events,
            closed: AtomicBool::new(false),
            log: Arc::clone(&self.log),
        });
        lock(&self.sessions).insert(spec.name.clone(), Arc::clone(&session));
        Ok(session)
    }
}
