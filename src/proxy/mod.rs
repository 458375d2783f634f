//! Lifecycle coordinator and request router.
//!
//! [`Proxy`] owns one [`DownstreamConnection`] per server, the published
//! [`Catalog`] snapshot, and the outward notification channel. Outward
//! transports attach through [`ProxyFront`](front::ProxyFront).
//!
//! State machine: `Uninitialized → Connecting → Ready → ShuttingDown → Closed`.

pub mod front;
pub mod subscriptions;

use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::Catalog;
use crate::config::ProxyConfig;
use crate::descriptor::{validate_specs, ServerSpec};
use crate::downstream::types::error_codes;
use crate::downstream::{
    CapabilityKind, ConnectionOptions, DownstreamConnection, DownstreamEvent, DownstreamEventKind,
    ProxyError, SessionFactory, TransportFactory,
};
use subscriptions::SubscriptionRegistry;

pub use front::ProxyFront;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Buffered outward notifications per attached front.
const OUTWARD_CHANNEL_CAPACITY: usize = 256;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Lifecycle of the whole proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Connecting,
    Ready,
    ShuttingDown,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
        })
    }
}

/// Settle policy for [`Proxy::connect_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Strict mode: any terminal connection failure aborts the proxy.
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub connection: ConnectionOptions,
}

/// Outcome of [`Proxy::connect_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    /// `(server, cause)` for every connection that ended `Failed`.
    pub failed: Vec<(String, String)>,
}

/// Outcome of [`Proxy::close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub closed: Vec<String>,
    /// `(server, cause)` for every connection whose teardown reported an error.
    pub failures: Vec<(String, String)>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Which attached clients an outward notification is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    Clients(Vec<Uuid>),
}

impl Audience {
    pub fn includes(&self, client: Uuid) -> bool {
        match self {
            Self::All => true,
            Self::Clients(ids) => ids.contains(&client),
        }
    }
}

/// A notification to send to outward clients.
#[derive(Debug, Clone)]
pub struct OutwardNotification {
    pub method: String,
    pub params: Option<Value>,
    pub audience: Audience,
}

// ─── Proxy ───────────────────────────────────────────────────────────────────

pub struct Proxy {
    name: String,
    options: ProxyOptions,
    factory: Arc<dyn SessionFactory>,
    connections: RwLock<Vec<Arc<DownstreamConnection>>>,
    catalog: RwLock<Arc<Catalog>>,
    /// Serializes rebuilds so snapshots are published in build order.
    rebuild_lock: tokio::sync::Mutex<()>,
    /// Wakes the rebuild worker; pending wakeups coalesce into one rebuild.
    rebuild_wanted: Arc<Notify>,
    state: Mutex<LifecycleState>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<DownstreamEvent>,
    outward: broadcast::Sender<OutwardNotification>,
    subscriptions: Mutex<SubscriptionRegistry>,
    close_report: OnceCell<CloseReport>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Proxy {
    /// Construct a proxy over `specs`, rejecting malformed specs before any
    /// connection attempt.
    ///
    /// Must be called from within a Tokio runtime: it spawns the task that
    /// reacts to downstream events and the task that rebuilds on demand.
    pub fn new(
        name: impl Into<String>,
        specs: Vec<ServerSpec>,
        options: ProxyOptions,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Arc<Self>, ProxyError> {
        validate_specs(&specs)?;

        let shutdown = CancellationToken::new();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outward, _) = broadcast::channel(OUTWARD_CHANNEL_CAPACITY);
        let rebuild_wanted = Arc::new(Notify::new());

        let connections = specs
            .into_iter()
            .map(|spec| {
                Arc::new(DownstreamConnection::new(
                    spec,
                    Arc::clone(&factory),
                    options.connection.clone(),
                    events.clone(),
                    &shutdown,
                ))
            })
            .collect();

        let proxy = Arc::new(Self {
            name: name.into(),
            options,
            factory,
            connections: RwLock::new(connections),
            catalog: RwLock::new(Arc::new(Catalog::empty())),
            rebuild_lock: tokio::sync::Mutex::new(()),
            rebuild_wanted: Arc::clone(&rebuild_wanted),
            state: Mutex::new(LifecycleState::Uninitialized),
            shutdown: shutdown.clone(),
            events,
            outward,
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            close_report: OnceCell::new(),
        });

        tokio::spawn(pump_events(Arc::downgrade(&proxy), events_rx, shutdown.clone()));
        tokio::spawn(run_rebuilds(Arc::downgrade(&proxy), rebuild_wanted, shutdown));
        Ok(proxy)
    }

    /// Construct from a loaded configuration with the production transports.
    pub fn from_config(config: &ProxyConfig) -> Result<Arc<Self>, ProxyError> {
        let factory = Arc::new(TransportFactory::new()?);
        Self::new(
            config.name.clone(),
            config.servers.clone(),
            ProxyOptions {
                connection: config.connect.connection_options(),
            },
            factory,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LifecycleState) {
        *lock(&self.state) = state;
    }

    /// Move `from → to` only if still in `from`.
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), ProxyError> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(ProxyError::InvalidState { state: *state });
        }
        *state = to;
        tracing::debug!(proxy = %self.name, from = %from, to = %to, "lifecycle transition");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), ProxyError> {
        match self.state() {
            LifecycleState::Ready => Ok(()),
            state => Err(ProxyError::InvalidState { state }),
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(
            &self
                .catalog
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    pub fn connections(&self) -> Vec<Arc<DownstreamConnection>> {
        self.connections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<DownstreamConnection>> {
        self.connections()
            .into_iter()
            .find(|c| c.name() == name)
    }

    /// Receive outward notifications (list changes, resource updates).
    pub fn subscribe_outward(&self) -> broadcast::Receiver<OutwardNotification> {
        self.outward.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every downstream concurrently and wait for all to settle.
    ///
    /// Best-effort (default) reaches `Ready` with whatever connected. Strict
    /// (`fail_fast`) closes everything and fails with `StartupFailed` if any
    /// server failed.
    pub async fn connect_all(&self, options: ConnectOptions) -> Result<ConnectReport, ProxyError> {
        self.transition(LifecycleState::Uninitialized, LifecycleState::Connecting)?;

        let connections = self.connections();
        tracing::info!(
            proxy = %self.name,
            servers = connections.len(),
            fail_fast = options.fail_fast,
            "connecting to downstream servers"
        );
        let start = Instant::now();

        let outcomes = futures::future::join_all(connections.iter().map(|conn| async move {
            (conn.name().to_string(), conn.connect().await)
        }))
        .await;

        if self.shutdown.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let mut report = ConnectReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => report.connected.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }

        if options.fail_fast && !report.failed.is_empty() {
            tracing::error!(
                proxy = %self.name,
                failed = report.failed.len(),
                "strict startup failed, closing all connections"
            );
            self.close().await;
            return Err(ProxyError::StartupFailed {
                failures: report.failed,
            });
        }

        self.rebuild().await;
        self.transition(LifecycleState::Connecting, LifecycleState::Ready)?;
        tracing::info!(
            proxy = %self.name,
            connected = report.connected.len(),
            failed = report.failed.len(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "proxy ready"
        );
        Ok(report)
    }

    /// Close every connection concurrently and reach `Closed`.
    ///
    /// Never fails; teardown errors are collected in the report. Concurrent
    /// and repeated calls wait for the first and observe the same report.
    pub async fn close(&self) -> CloseReport {
        self.close_report
            .get_or_init(|| async {
                self.set_state(LifecycleState::ShuttingDown);
                self.shutdown.cancel();

                let connections = self.connections();
                let outcomes =
                    futures::future::join_all(connections.iter().map(|conn| async move {
                        (conn.name().to_string(), conn.close().await)
                    }))
                    .await;

                let mut report = CloseReport::default();
                for (name, outcome) in outcomes {
                    match outcome {
                        Ok(()) => report.closed.push(name),
                        Err(e) => {
                            tracing::warn!(
                                server = %name,
                                error = %e,
                                "error while closing connection"
                            );
                            report.failures.push((name, e.to_string()));
                        }
                    }
                }

                let mut catalog = self
                    .catalog
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                *catalog = Arc::new(Catalog::empty());
                drop(catalog);
                self.set_state(LifecycleState::Closed);
                tracing::info!(
                    proxy = %self.name,
                    closed = report.closed.len(),
                    failures = report.failures.len(),
                    "proxy closed"
                );
                report
            })
            .await
            .clone()
    }

    /// Rebuild the catalog from the current connections and publish it.
    ///
    /// Emits `list_changed` outward for every kind whose view changed.
    pub async fn rebuild(&self) -> Vec<CapabilityKind> {
        let _guard = self.rebuild_lock.lock().await;
        let next = Arc::new(Catalog::build(&self.connections()).await);
        let previous = std::mem::replace(
            &mut *self
                .catalog
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            Arc::clone(&next),
        );

        let changed = next.changed_kinds(&previous);
        let mut methods: Vec<&str> = Vec::new();
        for method in changed.iter().map(|k| k.list_changed_method()) {
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        for method in methods {
            tracing::debug!(proxy = %self.name, method, "announcing catalog change");
            // No receivers simply means no client is attached yet.
            let _ = self.outward.send(OutwardNotification {
                method: method.to_string(),
                params: None,
                audience: Audience::All,
            });
        }
        changed
    }

    /// Ask the background worker for a rebuild without waiting for it.
    pub fn request_rebuild(&self) {
        self.rebuild_wanted.notify_one();
    }

    // ─── Topology ────────────────────────────────────────────────────────

    /// Add a server at runtime, connect it, then rebuild.
    ///
    /// A server that fails to connect stays registered as `Failed` so it can
    /// be retried with [`reconnect_server`](Self::reconnect_server).
    pub async fn add_server(&self, spec: ServerSpec) -> Result<(), ProxyError> {
        self.ensure_ready()?;
        spec.validate()?;

        let conn = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if connections.iter().any(|c| c.name() == spec.name) {
                return Err(ProxyError::Config {
                    reason: format!("duplicate server name '{}'", spec.name),
                });
            }
            let conn = Arc::new(DownstreamConnection::new(
                spec,
                Arc::clone(&self.factory),
                self.options.connection.clone(),
                self.events.clone(),
                &self.shutdown,
            ));
            connections.push(Arc::clone(&conn));
            conn
        };

        tracing::info!(server = %conn.name(), "adding downstream server");
        let outcome = conn.connect().await;
        self.rebuild().await;
        outcome
    }

    /// Close and remove a server, then rebuild.
    pub async fn remove_server(&self, name: &str) -> Result<(), ProxyError> {
        self.ensure_ready()?;
        let conn = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let idx = connections
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| ProxyError::UnknownServer {
                    name: name.to_string(),
                })?;
            connections.remove(idx)
        };

        tracing::info!(server = %name, "removing downstream server");
        if let Err(e) = conn.close().await {
            tracing::warn!(server = %name, error = %e, "error while closing removed server");
        }
        lock(&self.subscriptions).remove_server(name);
        self.rebuild().await;
        Ok(())
    }

    /// Close and reconnect one server, restore its subscriptions, then rebuild.
    pub async fn reconnect_server(&self, name: &str) -> Result<(), ProxyError> {
        self.ensure_ready()?;
        let conn = self.connection(name).ok_or_else(|| ProxyError::UnknownServer {
            name: name.to_string(),
        })?;

        tracing::info!(server = %name, "reconnecting downstream server");
        let outcome = conn.reconnect().await;
        if outcome.is_ok() {
            let uris = lock(&self.subscriptions).uris_for_server(name);
            for uri in uris {
                if let Err(e) = conn.subscribe(&uri).await {
                    tracing::warn!(
                        server = %name,
                        uri = %uri,
                        error = %e,
                        "failed to restore subscription"
                    );
                }
            }
        }
        self.rebuild().await;
        outcome
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// Route `tools/call` by external name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ProxyError> {
        self.ensure_ready()?;
        let (owner, original) = {
            let catalog = self.catalog();
            let entry = catalog.tools.resolve(name)?;
            (Arc::clone(&entry.owner), entry.original_id.clone())
        };

        let start = Instant::now();
        let outcome = owner.call_tool(&original, arguments).await;
        tracing::info!(
            tool = %name,
            server = %owner.name(),
            ok = outcome.is_ok(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "tool call routed"
        );
        outcome
    }

    /// Route `resources/read` by external URI, falling back to templates.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, ProxyError> {
        self.ensure_ready()?;
        let (owner, original) = self.catalog().resolve_resource(uri)?;
        let mut result = owner.read_resource(&original).await?;
        rewrite_content_uris(&mut result, &original, uri);
        Ok(result)
    }

    /// Route `prompts/get` by external name.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ProxyError> {
        self.ensure_ready()?;
        let (owner, original) = {
            let catalog = self.catalog();
            let entry = catalog.prompts.resolve(name)?;
            (Arc::clone(&entry.owner), entry.original_id.clone())
        };
        owner.get_prompt(&original, arguments).await
    }

    /// Route `completion/complete` by its prompt or resource reference.
    pub async fn complete(&self, mut params: Value) -> Result<Value, ProxyError> {
        self.ensure_ready()?;
        let catalog = self.catalog();
        let reference = params.get("ref").cloned().unwrap_or(Value::Null);
        let field = |key: &str| reference.get(key).and_then(Value::as_str).map(str::to_string);

        let (owner, key, original) = match reference.get("type").and_then(Value::as_str) {
            Some("ref/prompt") => {
                let name = field("name").ok_or_else(|| invalid("ref.name is required"))?;
                let entry = catalog.prompts.resolve(&name)?;
                (Arc::clone(&entry.owner), "name", entry.original_id.clone())
            }
            Some("ref/resource") => {
                let uri = field("uri").ok_or_else(|| invalid("ref.uri is required"))?;
                match catalog.templates.get(&uri) {
                    Some(entry) => (Arc::clone(&entry.owner), "uri", entry.original_id.clone()),
                    None => {
                        let (owner, original) = catalog.resolve_resource(&uri)?;
                        (owner, "uri", original)
                    }
                }
            }
            _ => return Err(invalid("ref.type must be 'ref/prompt' or 'ref/resource'")),
        };

        params["ref"][key] = Value::String(original);
        owner.complete(params).await
    }

    /// Subscribe `client` to an external resource URI.
    pub async fn subscribe(&self, client: Uuid, uri: &str) -> Result<(), ProxyError> {
        self.ensure_ready()?;
        let (owner, original) = self.catalog().resolve_resource(uri)?;
        if !owner.server_info().is_some_and(|info| info.supports_subscribe()) {
            return Err(ProxyError::Upstream {
                server: owner.name().to_string(),
                code: error_codes::METHOD_NOT_FOUND,
                message: "server does not support resource subscriptions".into(),
                data: None,
            });
        }

        let outcome = lock(&self.subscriptions).add(owner.name(), &original, client);
        let result = outcome
            .get_or_init(|| async {
                let result = owner.subscribe(&original).await;
                if result.is_ok() {
                    tracing::debug!(
                        server = %owner.name(),
                        uri = %original,
                        "subscribed downstream"
                    );
                }
                result
            })
            .await
            .clone();
        if result.is_err() {
            lock(&self.subscriptions).remove(owner.name(), &original, client);
        }
        result
    }

    /// Drop `client`'s subscription to an external resource URI.
    pub async fn unsubscribe(&self, client: Uuid, uri: &str) -> Result<(), ProxyError> {
        self.ensure_ready()?;
        let (owner, original) = self.catalog().resolve_resource(uri)?;
        let last = lock(&self.subscriptions).remove(owner.name(), &original, client);
        if last {
            owner.unsubscribe(&original).await?;
            tracing::debug!(server = %owner.name(), uri = %original, "unsubscribed downstream");
        }
        Ok(())
    }

    /// Release everything held for a client that went away.
    pub async fn drop_client(&self, client: Uuid) {
        let released = lock(&self.subscriptions).remove_client(client);
        for sub in released {
            let Some(conn) = self.connection(&sub.server) else {
                continue;
            };
            if !conn.is_connected() {
                continue;
            }
            if let Err(e) = conn.unsubscribe(&sub.original_uri).await {
                tracing::debug!(
                    server = %sub.server,
                    uri = %sub.original_uri,
                    error = %e,
                    "unsubscribe on disconnect failed"
                );
            }
        }
    }

    /// Outward `initialize` result.
    pub fn initialize_result(&self, params: Option<&Value>) -> Value {
        const SUPPORTED: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(crate::downstream::connection::PROTOCOL_VERSION);
        let version = if SUPPORTED.contains(&requested) {
            requested
        } else {
            crate::downstream::connection::PROTOCOL_VERSION
        };

        let instructions: Vec<String> = self
            .connections()
            .iter()
            .filter_map(|conn| {
                let info = conn.server_info()?;
                let text = info.instructions.as_deref()?.trim();
                (!text.is_empty()).then(|| format!("[{}] {text}", conn.name()))
            })
            .collect();

        let mut result = serde_json::json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "subscribe": true, "listChanged": true },
                "prompts": { "listChanged": true },
                "completions": {},
                "logging": {},
            },
            "serverInfo": {
                "name": self.name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        if !instructions.is_empty() {
            result["instructions"] = Value::String(instructions.join("\n\n"));
        }
        result
    }

    // ─── Downstream events ───────────────────────────────────────────────

    /// Must not await downstream work: one slow server would hold up events
    /// from every other server.
    fn handle_event(self: &Arc<Self>, event: DownstreamEvent) {
        let DownstreamEvent { server, kind } = event;
        match kind {
            DownstreamEventKind::Closed { reason } => {
                let Some(conn) = self.connection(&server) else {
                    return;
                };
                let proxy = Arc::clone(self);
                tokio::spawn(async move {
                    if conn.mark_failed(&reason).await {
                        tracing::warn!(
                            server = %server,
                            reason = %reason,
                            "downstream server went away"
                        );
                        proxy.request_rebuild();
                    }
                });
            }
            DownstreamEventKind::Notification { method, params } => match method.as_str() {
                "notifications/tools/list_changed"
                | "notifications/resources/list_changed"
                | "notifications/prompts/list_changed" => {
                    tracing::debug!(
                        server = %server,
                        method = %method,
                        "downstream catalog changed"
                    );
                    self.request_rebuild();
                }
                "notifications/resources/updated" => {
                    self.forward_resource_update(&server, params);
                }
                "notifications/message" => {
                    tracing::debug!(server = %server, params = ?params, "downstream log message");
                }
                _ => {
                    tracing::trace!(
                        server = %server,
                        method = %method,
                        "ignoring downstream notification"
                    );
                }
            },
        }
    }

    /// Forward `notifications/resources/updated` to the clients subscribed to
    /// it, naming the resource by its external URI in the current catalog.
    fn forward_resource_update(&self, server: &str, params: Option<Value>) {
        let Some(uri) = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let Some(clients) = lock(&self.subscriptions).lookup(server, uri) else {
            return;
        };
        let Some(external) = self.catalog().external_resource_uri(server, uri) else {
            tracing::debug!(server = %server, uri = %uri, "updated resource is not in the catalog");
            return;
        };
        let mut params = params.unwrap_or_else(|| serde_json::json!({}));
        params["uri"] = Value::String(external);
        let _ = self.outward.send(OutwardNotification {
            method: "notifications/resources/updated".to_string(),
            params: Some(params),
            audience: Audience::Clients(clients),
        });
    }
}

fn invalid(reason: &str) -> ProxyError {
    ProxyError::InvalidParams {
        reason: reason.to_string(),
    }
}

/// Point `contents[].uri` back at the external URI the client asked for.
fn rewrite_content_uris(result: &mut Value, original: &str, external: &str) {
    if original == external {
        return;
    }
    if let Some(contents) = result.get_mut("contents").and_then(Value::as_array_mut) {
        for item in contents {
            if item.get("uri").and_then(Value::as_str) == Some(original) {
                item["uri"] = Value::String(external.to_string());
            }
        }
    }
}

/// React to downstream events until shutdown or until the proxy is dropped.
async fn pump_events(
    proxy: Weak<Proxy>,
    mut events: mpsc::UnboundedReceiver<DownstreamEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(proxy) = proxy.upgrade() else {
            break;
        };
        proxy.handle_event(event);
    }
    tracing::debug!("downstream event pump stopped");
}

/// Rebuild whenever asked; requests made during a rebuild fold into the next.
async fn run_rebuilds(proxy: Weak<Proxy>, wanted: Arc<Notify>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wanted.notified() => {}
        }
        let Some(proxy) = proxy.upgrade() else {
            break;
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = proxy.rebuild() => {}
        }
    }
    tracing::debug!("rebuild worker stopped");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::TransportDescriptor;
    use crate::downstream::testing::{FakeFactory, FakeServer};
    use crate::downstream::{ConnectionState, RetryPolicy};
    use std::time::Duration;

    pub(crate) fn spec(name: &str) -> ServerSpec {
        ServerSpec::new(name, TransportDescriptor::stdio("fake", Vec::<String>::new()))
    }

    pub(crate) fn fast_options() -> ProxyOptions {
        ProxyOptions {
            connection: ConnectionOptions {
                retry: RetryPolicy {
                    max_attempts: 3,
                    delay: Duration::from_millis(5),
                },
                init_timeout: Duration::from_secs(5),
                request_timeout: Duration::from_secs(5),
            },
        }
    }

    pub(crate) fn proxy(factory: &Arc<FakeFactory>, names: &[&str]) -> Arc<Proxy> {
        Proxy::new(
            "test-proxy",
            names.iter().map(|n| spec(n)).collect(),
            fast_options(),
            Arc::clone(factory) as Arc<dyn SessionFactory>,
        )
        .unwrap()
    }

    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn two_servers() -> Arc<FakeFactory> {
        FakeFactory::new()
            .with_server(
                "github",
                FakeServer::new().with_tool("search").with_prompt("review"),
            )
            .with_server(
                "memory",
                FakeServer::new()
                    .with_tool("search")
                    .with_failing_tool("lookup", -32001, "entry not found")
                    .with_resource("memory://notes")
                    .with_template("memory://{key}"),
            )
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected_before_connecting() {
        let factory = two_servers();
        let err = Proxy::new(
            "p",
            vec![spec("github"), spec("github")],
            fast_options(),
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
        assert_eq!(factory.open_count("github"), 0);
    }

    #[tokio::test]
    async fn test_best_effort_connects_available_subset() {
        let factory = two_servers().with_unreachable("broken");
        let proxy = proxy(&factory, &["broken", "memory"]);

        let report = proxy.connect_all(ConnectOptions { fail_fast: false }).await.unwrap();
        assert_eq!(report.connected, vec!["memory".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(proxy.state(), LifecycleState::Ready);
        assert_eq!(factory.open_count("broken"), 3);

        let catalog = proxy.catalog();
        assert_eq!(catalog.tools.ids(), vec!["search", "lookup"]);
        assert_eq!(catalog.count_for_server("broken"), 0);
    }

    #[tokio::test]
    async fn test_strict_mode_fails_and_closes_everything() {
        let factory = two_servers().with_unreachable("broken");
        let proxy = proxy(&factory, &["memory", "broken"]);

        let err = proxy.connect_all(ConnectOptions { fail_fast: true }).await.unwrap_err();
        match err {
            ProxyError::StartupFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "broken");
            }
            other => panic!("expected StartupFailed, got {other:?}"),
        }
        assert_eq!(proxy.state(), LifecycleState::Closed);
        assert_eq!(factory.close_count("memory"), 1);
        assert!(proxy.catalog().tools.is_empty());
    }

    #[tokio::test]
    async fn test_empty_server_list_reaches_ready() {
        let factory = FakeFactory::new();
        let proxy = proxy(&factory, &[]);
        let report = proxy.connect_all(ConnectOptions::default()).await.unwrap();
        assert!(report.connected.is_empty());
        assert_eq!(proxy.state(), LifecycleState::Ready);
        assert!(proxy.catalog().tools.is_empty());
    }

    #[tokio::test]
    async fn test_connect_all_only_once() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let err = proxy.connect_all(ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidState { state: LifecycleState::Ready }));
    }

    #[tokio::test]
    async fn test_collision_routes_to_each_owner() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github", "memory"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        let bare = proxy.call_tool("search", None).await.unwrap();
        assert_eq!(bare["content"][0]["text"], "github:search");

        let scoped = proxy
            .call_tool("memory__search", Some(serde_json::json!({"q": "x"})))
            .await
            .unwrap();
        assert_eq!(scoped["content"][0]["text"], "memory:search");

        let forwarded = factory
            .requests("memory")
            .into_iter()
            .find(|(m, _)| m == "tools/call")
            .and_then(|(_, p)| p)
            .unwrap();
        assert_eq!(forwarded["name"], "search");
        assert_eq!(forwarded["arguments"]["q"], "x");
    }

    #[tokio::test]
    async fn test_downstream_error_names_server() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github", "memory"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        let err = proxy.call_tool("lookup", None).await.unwrap_err();
        assert_eq!(err.to_string(), "[memory] entry not found");
        assert_eq!(err.to_json_rpc().code, -32001);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let err = proxy.call_tool("nope", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { kind: CapabilityKind::Tool, .. }));
    }

    #[tokio::test]
    async fn test_read_resource_and_template() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["memory"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        let exact = proxy.read_resource("memory://notes").await.unwrap();
        assert_eq!(exact["contents"][0]["text"], "memory:memory://notes");

        let templated = proxy.read_resource("memory://todo").await.unwrap();
        assert_eq!(templated["contents"][0]["uri"], "memory://todo");
    }

    #[tokio::test]
    async fn test_complete_rewrites_prompt_reference() {
        let factory = FakeFactory::new()
            .with_server("a", FakeServer::new().with_prompt("review"))
            .with_server("b", FakeServer::new().with_prompt("review"));
        let proxy = proxy(&factory, &["a", "b"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        let result = proxy
            .complete(serde_json::json!({
                "ref": { "type": "ref/prompt", "name": "b__review" },
                "argument": { "name": "style", "value": "te" },
            }))
            .await
            .unwrap();
        assert_eq!(result["completion"]["values"][0], "b");

        let (_, params) = factory
            .requests("b")
            .into_iter()
            .find(|(m, _)| m == "completion/complete")
            .unwrap();
        assert_eq!(params.unwrap()["ref"]["name"], "review");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github", "memory"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        let (first, second) = tokio::join!(proxy.close(), proxy.close());
        assert_eq!(first, second);
        assert!(first.is_clean());
        assert_eq!(proxy.close().await, first);
        assert_eq!(proxy.state(), LifecycleState::Closed);
        assert_eq!(factory.close_count("github"), 1);
        assert_eq!(factory.close_count("memory"), 1);

        let err = proxy.call_tool("search", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidState { state: LifecycleState::Closed }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_connect_skips_backoff() {
        let factory = two_servers().with_unreachable("broken");
        let proxy = Proxy::new(
            "p",
            vec![spec("broken")],
            ProxyOptions::default(),
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
        )
        .unwrap();

        let connecting = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.connect_all(ConnectOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        proxy.close().await;

        let outcome = connecting.await.unwrap();
        assert!(matches!(outcome, Err(ProxyError::Cancelled)));
        assert_eq!(factory.open_count("broken"), 1);
        assert_eq!(proxy.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn test_crash_removes_capabilities_and_surfaces_unavailable() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github", "memory"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let mut outward = proxy.subscribe_outward();

        factory.session("memory").unwrap().crash();
        let conn = proxy.connection("memory").unwrap();
        wait_until(|| conn.state() == ConnectionState::Failed).await;
        wait_until(|| proxy.catalog().count_for_server("memory") == 0).await;

        let note = outward.recv().await.unwrap();
        assert_eq!(note.method, "notifications/tools/list_changed");
        assert_eq!(note.audience, Audience::All);

        assert_eq!(proxy.catalog().tools.ids(), vec!["search"]);
        let err = conn.call_tool("search", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_downstream_list_changed_triggers_rebuild() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        factory.edit_server("github", |s| s.tools.push("create_issue".into()));
        factory
            .session("github")
            .unwrap()
            .emit("notifications/tools/list_changed", None);
        wait_until(|| proxy.catalog().tools.get("create_issue").is_some()).await;
    }

    #[tokio::test]
    async fn test_add_remove_reconnect_server() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        proxy.add_server(spec("memory")).await.unwrap();
        assert!(proxy.catalog().tools.get("memory__search").is_some());

        let dup = proxy.add_server(spec("memory")).await.unwrap_err();
        assert!(matches!(dup, ProxyError::Config { .. }));

        proxy.reconnect_server("memory").await.unwrap();
        assert_eq!(factory.open_count("memory"), 2);
        assert!(proxy.catalog().tools.get("memory__search").is_some());

        proxy.remove_server("memory").await.unwrap();
        assert!(proxy.catalog().tools.get("memory__search").is_none());
        assert!(proxy.connection("memory").is_none());

        let missing = proxy.remove_server("memory").await.unwrap_err();
        assert!(matches!(missing, ProxyError::UnknownServer { .. }));
    }

    #[tokio::test]
    async fn test_failed_add_can_be_reconnected() {
        let factory = two_servers().with_failures("memory", 3);
        let proxy = proxy(&factory, &["github"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();

        assert!(proxy.add_server(spec("memory")).await.is_err());
        assert_eq!(proxy.connection("memory").unwrap().state(), ConnectionState::Failed);

        proxy.reconnect_server("memory").await.unwrap();
        assert!(proxy.catalog().tools.get("lookup").is_some());
    }

    #[tokio::test]
    async fn test_resource_update_reaches_subscribers_only() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["memory"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let mut outward = proxy.subscribe_outward();

        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        proxy.subscribe(alice, "memory://notes").await.unwrap();
        proxy.subscribe(bob, "memory://notes").await.unwrap();
        let downstream_subscribes = factory
            .requests("memory")
            .iter()
            .filter(|(m, _)| m == "resources/subscribe")
            .count();
        assert_eq!(downstream_subscribes, 1);

        proxy.unsubscribe(bob, "memory://notes").await.unwrap();
        assert!(!factory.requested("memory", "resources/unsubscribe"));

        factory.session("memory").unwrap().emit(
            "notifications/resources/updated",
            Some(serde_json::json!({ "uri": "memory://notes" })),
        );
        let note = outward.recv().await.unwrap();
        assert_eq!(note.method, "notifications/resources/updated");
        assert!(note.audience.includes(alice));
        assert!(!note.audience.includes(bob));
        assert_eq!(note.params.unwrap()["uri"], "memory://notes");

        proxy.drop_client(alice).await;
        assert!(factory.requested("memory", "resources/unsubscribe"));
    }

    #[tokio::test]
    async fn test_resource_update_uses_current_external_uri() {
        let factory = FakeFactory::new()
            .with_server("github", FakeServer::new().with_resource("file:///a"))
            .with_server("docs", FakeServer::new().with_resource("file:///a"));
        let proxy = proxy(&factory, &["github", "docs"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let mut outward = proxy.subscribe_outward();

        let client = Uuid::new_v4();
        proxy.subscribe(client, "docs+file:///a").await.unwrap();

        factory.session("github").unwrap().crash();
        wait_until(|| proxy.catalog().resources.ids() == vec!["file:///a"]).await;

        factory.session("docs").unwrap().emit(
            "notifications/resources/updated",
            Some(serde_json::json!({ "uri": "file:///a" })),
        );
        let note = loop {
            let note = outward.recv().await.unwrap();
            if note.method == "notifications/resources/updated" {
                break note;
            }
        };
        assert!(note.audience.includes(client));
        assert_eq!(note.params.unwrap()["uri"], "file:///a");

        let read = proxy.read_resource("file:///a").await.unwrap();
        assert_eq!(read["contents"][0]["text"], "docs:file:///a");
    }

    #[tokio::test]
    async fn test_hung_rebuild_does_not_hold_up_other_servers() {
        let factory = FakeFactory::new()
            .with_server("slow", FakeServer::new().with_tool("wait"))
            .with_server("fast", FakeServer::new().with_resource("fast://feed"));
        let proxy = proxy(&factory, &["slow", "fast"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let mut outward = proxy.subscribe_outward();

        let client = Uuid::new_v4();
        proxy.subscribe(client, "fast://feed").await.unwrap();

        factory.edit_server("slow", |s| s.hang_lists = true);
        factory
            .session("slow")
            .unwrap()
            .emit("notifications/tools/list_changed", None);
        factory.session("fast").unwrap().emit(
            "notifications/resources/updated",
            Some(serde_json::json!({ "uri": "fast://feed" })),
        );

        let note = tokio::time::timeout(Duration::from_secs(1), outward.recv())
            .await
            .expect("update delayed behind a rebuild")
            .unwrap();
        assert_eq!(note.method, "notifications/resources/updated");
        assert_eq!(note.params.unwrap()["uri"], "fast://feed");
    }

    #[tokio::test]
    async fn test_list_changed_bursts_coalesce() {
        let factory = two_servers();
        let proxy = proxy(&factory, &["github"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let list_calls = || {
            factory
                .requests("github")
                .iter()
                .filter(|(m, _)| m == "tools/list")
                .count()
        };
        assert_eq!(list_calls(), 1);

        factory.edit_server("github", |s| s.tools.push("create_issue".into()));
        let session = factory.session("github").unwrap();
        for _ in 0..5 {
            session.emit("notifications/tools/list_changed", None);
        }
        wait_until(|| proxy.catalog().tools.get("create_issue").is_some()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(list_calls() <= 3, "rebuilt {} times", list_calls() - 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_downstream_failure() {
        let factory = FakeFactory::new().with_server(
            "docs",
            FakeServer::new()
                .with_resource("file:///a")
                .rejecting_subscribe(),
        );
        let proxy = proxy(&factory, &["docs"]);
        proxy.connect_all(ConnectOptions::default()).await.unwrap();
        let subscribe_calls = || {
            factory
                .requests("docs")
                .iter()
                .filter(|(m, _)| m == "resources/subscribe")
                .count()
        };

        let (first, second) = tokio::join!(
            proxy.subscribe(Uuid::new_v4(), "file:///a"),
            proxy.subscribe(Uuid::new_v4(), "file:///a"),
        );
        assert!(matches!(first, Err(ProxyError::Upstream { .. })));
        assert!(matches!(second, Err(ProxyError::Upstream { .. })));
        assert_eq!(subscribe_calls(), 1);

        factory.edit_server("docs", |s| s.reject_subscribe = false);
        proxy.subscribe(Uuid::new_v4(), "file:///a").await.unwrap();
        assert_eq!(subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_initialize_result_negotiates_version() {
        let factory = two_servers();
        let proxy = proxy(&factory, &[]);
        let known = proxy
            .initialize_result(Some(&serde_json::json!({"protocolVersion": "2024-11-05"})));
        assert_eq!(known["protocolVersion"], "2024-11-05");
        let unknown = proxy
            .initialize_result(Some(&serde_json::json!({"protocolVersion": "1999-01-01"})));
        assert_eq!(
            unknown["protocolVersion"],
            crate::downstream::connection::PROTOCOL_VERSION
        );
        assert_eq!(unknown["serverInfo"]["name"], "test-proxy");
    }
}
