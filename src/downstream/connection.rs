//! Downstream connection: one live session to one downstream server.
//!
//! The connection owns retry policy, the MCP handshake, and the state
//! machine (`Disconnected → Connecting → Connected | Failed`). The wire
//! details live behind [`Session`], so retry is composed around a plain
//! session handle rather than baked into the transport.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::ProxyError;
use super::session::{format_diagnostics_suffix, Session, SessionFactory};
use super::types::{
    Capability, EventSink, InitializeResult, Prompt, Resource, ResourceTemplate, Tool,
};
use crate::descriptor::ServerSpec;

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision requested during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Upper bound on `nextCursor` pages followed for a single list call.
const MAX_LIST_PAGES: usize = 100;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Connection-establishment retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(2500),
        }
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub retry: RetryPolicy,
    /// Bound on opening the transport and on the `initialize` round trip.
    pub init_timeout: Duration,
    /// Bound on every request after the handshake.
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            init_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle of a single downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    last_error: Option<String>,
    attempts: u32,
}

/// A handshaken session plus what the server told us about itself.
#[derive(Clone)]
struct Live {
    session: Arc<dyn Session>,
    init: Arc<InitializeResult>,
}

// ─── DownstreamConnection ────────────────────────────────────────────────────

/// One downstream server and its (at most one) live session.
pub struct DownstreamConnection {
    spec: ServerSpec,
    options: ConnectionOptions,
    factory: Arc<dyn SessionFactory>,
    events: EventSink,
    live: RwLock<Option<Live>>,
    status: Mutex<Status>,
    /// Serializes connect / close / mark_failed.
    lifecycle: tokio::sync::Mutex<()>,
    /// Proxy-wide shutdown scope; each connect cycle runs under a child of it.
    parent_cancel: CancellationToken,
    cancel: Mutex<CancellationToken>,
}

impl fmt::Debug for DownstreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamConnection")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DownstreamConnection {
    pub fn new(
        spec: ServerSpec,
        factory: Arc<dyn SessionFactory>,
        options: ConnectionOptions,
        events: EventSink,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            spec,
            options,
            factory,
            events,
            live: RwLock::new(None),
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                last_error: None,
                attempts: 0,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            parent_cancel: shutdown.clone(),
            cancel: Mutex::new(shutdown.child_token()),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Cause of the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    /// Attempts made by the most recent connect cycle.
    pub fn attempts(&self) -> u32 {
        self.status().attempts
    }

    /// What the server reported during `initialize`, while connected.
    pub fn server_info(&self) -> Option<Arc<InitializeResult>> {
        self.live_slot().as_ref().map(|live| Arc::clone(&live.init))
    }

    fn live_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<Live>> {
        self.live
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take_live(&self) -> Option<Live> {
        self.live
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status().state = state;
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Establish the session, retrying per the configured policy.
    ///
    /// Returns immediately when already connected. Shutdown cancels both an
    /// in-flight attempt and the backoff wait.
    pub async fn connect(&self) -> Result<(), ProxyError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let cancel = self.cancel_token();
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            {
                let mut status = self.status();
                status.state = ConnectionState::Connecting;
                status.attempts = attempt;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ProxyError::Cancelled);
                }
                outcome = self.establish() => outcome,
            };

            match outcome {
                Ok(live) => {
                    *self
                        .live
                        .write()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(live);
                    {
                        let mut status = self.status();
                        status.state = ConnectionState::Connected;
                        status.last_error = None;
                    }
                    tracing::info!(
                        server = %self.spec.name,
                        transport = self.spec.transport.kind(),
                        attempt,
                        "connected to downstream server"
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.status().last_error = Some(last_error.clone());
                    tracing::warn!(
                        server = %self.spec.name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(ProxyError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.options.retry.delay) => {}
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        tracing::error!(
            server = %self.spec.name,
            attempts = max_attempts,
            error = %last_error,
            "giving up on downstream server"
        );
        Err(ProxyError::Connection {
            server: self.spec.name.clone(),
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// One attempt: open the transport and run the handshake.
    ///
    /// A handshake failure closes the half-open session before returning.
    async fn establish(&self) -> Result<Live, ProxyError> {
        let init_timeout = self.options.init_timeout;
        let session = tokio::time::timeout(
            init_timeout,
            self.factory.open(&self.spec, self.events.clone()),
        )
        .await
        .map_err(|_| ProxyError::InitFailed {
            name: self.spec.name.clone(),
            reason: format!("transport did not open within {}s", init_timeout.as_secs()),
        })??;

        match tokio::time::timeout(init_timeout, self.handshake(session.as_ref())).await {
            Ok(Ok(init)) => Ok(Live {
                session,
                init: Arc::new(init),
            }),
            outcome => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => format!("initialization timed out after {}s", init_timeout.as_secs()),
                };
                let diagnostics = session.diagnostics();
                if let Err(e) = session.close().await {
                    tracing::debug!(
                        server = %self.spec.name,
                        error = %e,
                        "failed to close half-open session"
                    );
                }
                Err(ProxyError::InitFailed {
                    name: self.spec.name.clone(),
                    reason: format!(
                        "{reason}{}",
                        format_diagnostics_suffix(diagnostics.as_deref())
                    ),
                })
            }
        }
    }

    async fn handshake(&self, session: &dyn Session) -> Result<InitializeResult, ProxyError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = session.request("initialize", Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| ProxyError::InitFailed {
                name: self.spec.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        session.notify("notifications/initialized", None).await?;

        tracing::debug!(
            server = %self.spec.name,
            protocol = %init.protocol_version,
            remote = ?init.server_info.as_ref().and_then(|i| i.name.clone()),
            "handshake complete"
        );
        Ok(init)
    }

    /// Close the session. Idempotent and safe from any state.
    ///
    /// Cancels an in-flight connect cycle first so shutdown never waits out
    /// a backoff.
    pub async fn close(&self) -> Result<(), ProxyError> {
        self.cancel_token().cancel();
        let _guard = self.lifecycle.lock().await;

        let result = match self.take_live() {
            Some(live) => live.session.close().await.map_err(|e| e.tagged(&self.spec.name)),
            None => Ok(()),
        };
        if self.state() != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
        tracing::debug!(server = %self.spec.name, "connection closed");
        result
    }

    /// Close and connect again under a fresh cancellation scope.
    pub async fn reconnect(&self) -> Result<(), ProxyError> {
        if let Err(e) = self.close().await {
            tracing::warn!(server = %self.spec.name, error = %e, "close before reconnect failed");
        }
        *self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = self.parent_cancel.child_token();
        self.set_state(ConnectionState::Disconnected);
        self.connect().await
    }

    /// React to the session ending on its own.
    ///
    /// Returns `true` when the connection moved to `Failed`; stale reports
    /// about an earlier, already-replaced session are ignored.
    pub async fn mark_failed(&self, reason: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        let is_current = self
            .live_slot()
            .as_ref()
            .is_some_and(|live| live.session.is_closed());
        if !is_current {
            return false;
        }
        if let Some(live) = self.take_live() {
            if let Err(e) = live.session.close().await {
                tracing::debug!(server = %self.spec.name, error = %e, "close after failure failed");
            }
        }
        let mut status = self.status();
        status.state = ConnectionState::Failed;
        status.last_error = Some(reason.to_string());
        true
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn live(&self) -> Result<Live, ProxyError> {
        let state = self.state();
        let unavailable = || ProxyError::UpstreamUnavailable {
            server: self.spec.name.clone(),
            state,
        };
        if state != ConnectionState::Connected {
            return Err(unavailable());
        }
        self.live_slot().clone().ok_or_else(unavailable)
    }

    /// Forward one request, bounded by the request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        let live = self.live()?;
        let start = Instant::now();
        let timeout = self.options.request_timeout;
        let outcome = tokio::time::timeout(timeout, live.session.request(method, params))
            .await
            .map_err(|_| ProxyError::Timeout {
                server: self.spec.name.clone(),
                method: method.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| e.tagged(&self.spec.name));

        tracing::debug!(
            server = %self.spec.name,
            method,
            ok = outcome.is_ok(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "downstream request finished"
        );
        outcome
    }

    /// List every item of one kind, following pagination.
    ///
    /// Kinds the server did not advertise yield an empty list without a request.
    pub async fn list<T: Capability>(&self) -> Result<Vec<T>, ProxyError> {
        let live = self.live()?;
        if !live.init.supports(T::KIND) {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let mut page = self.request(T::KIND.list_method(), params).await?;

            let raw = page
                .get_mut(T::KIND.list_key())
                .map(Value::take)
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let batch: Vec<T> = serde_json::from_value(raw).map_err(|e| ProxyError::Upstream {
                server: self.spec.name.clone(),
                code: super::types::error_codes::INTERNAL_ERROR,
                message: format!("malformed {} response: {e}", T::KIND.list_method()),
                data: None,
            })?;
            items.extend(batch);

            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(items),
            }
        }

        tracing::warn!(
            server = %self.spec.name,
            method = T::KIND.list_method(),
            pages = MAX_LIST_PAGES,
            "pagination limit reached, list truncated"
        );
        Ok(items)
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, ProxyError> {
        self.list().await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, ProxyError> {
        self.list().await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, ProxyError> {
        self.list().await
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, ProxyError> {
        self.list().await
    }

    /// `tools/call` with the downstream's own tool name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ProxyError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.request("tools/call", Some(params)).await
    }

    /// `resources/read` with the downstream's own URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, ProxyError> {
        self.request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    /// `prompts/get` with the downstream's own prompt name.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ProxyError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.request("prompts/get", Some(params)).await
    }

    pub async fn subscribe(&self, uri: &str) -> Result<(), ProxyError> {
        self.request("resources/subscribe", Some(serde_json::json!({ "uri": uri })))
            .await
            .map(drop)
    }

    pub async fn unsubscribe(&self, uri: &str) -> Result<(), ProxyError> {
        self.request("resources/unsubscribe", Some(serde_json::json!({ "uri": uri })))
            .await
            .map(drop)
    }

    /// `completion/complete`, params already rewritten to downstream ids.
    pub async fn complete(&self, params: Value) -> Result<Value, ProxyError> {
        self.request("completion/complete", Some(params)).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
