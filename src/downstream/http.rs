//! MCP streamable HTTP session.
//!
//! - HTTP POST per JSON-RPC message; the reply body is either a single JSON
//!   document or an SSE stream carrying the response (and any notifications
//!   the server interleaves)
//! - `Mcp-Session-Id` captured from the initialize response and echoed on
//!   every later request
//! - A background GET stream for server-initiated notifications, started once
//!   the session is initialized
//! - Best-effort DELETE on close

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::ProxyError;
use super::session::Session;
use super::sse::{header_map, is_event_stream, pump_events, route_event};
use super::transport::{cancelled_notification, extract_result, next_request_id, RpcDispatcher};
use super::types::{EventSink, IncomingMessage, JsonRpcNotification, JsonRpcRequest};

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Consecutive GET-stream failures tolerated before the listener gives up.
const MAX_LISTENER_FAILURES: u32 = 5;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);
const DELETE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Shared State ────────────────────────────────────────────────────────────

struct HttpInner {
    name: String,
    client: reqwest::Client,
    url: reqwest::Url,
    static_headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    dispatcher: Arc<RpcDispatcher>,
    replies: mpsc::UnboundedSender<Value>,
}

impl HttpInner {
    fn transport_error(&self, reason: String) -> ProxyError {
        ProxyError::Transport {
            server: self.name.clone(),
            reason,
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = self.static_headers.clone();
        if let Some(id) = lock(&self.session_id).as_deref() {
            if let Ok(value) = HeaderValue::from_str(id) {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }
        if let Some(version) = lock(&self.protocol_version).as_deref() {
            if let Ok(value) = HeaderValue::from_str(version) {
                headers.insert(PROTOCOL_VERSION_HEADER, value);
            }
        }
        headers
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = lock(&self.session_id);
            if current.as_deref() != Some(id) {
                tracing::debug!(server = %self.name, session_id = id, "captured MCP session id");
                *current = Some(id.to_string());
            }
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, ProxyError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST {} failed: {e}", self.url)))?;
        self.capture_session_id(&response);

        let status = response.status();
        if status == StatusCode::NOT_FOUND && lock(&self.session_id).is_some() {
            self.dispatcher.close("session expired (HTTP 404)", true);
            return Err(self.transport_error("session expired (HTTP 404)".into()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }

    /// Route every message in a response body through the dispatcher.
    async fn consume(&self, response: reqwest::Response) -> Result<(), ProxyError> {
        if is_event_stream(&response) {
            let dispatcher = &self.dispatcher;
            let replies = &self.replies;
            return pump_events(response, |event| route_event(dispatcher, replies, event))
                .await
                .map_err(|reason| self.transport_error(reason));
        }

        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read response body: {e}")))?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| self.transport_error(format!("invalid JSON response: {e}")))?;
        let messages = match body {
            Value::Array(items) => items,
            single => vec![single],
        };
        for message in messages {
            if let Some(reply) = self.dispatcher.dispatch(IncomingMessage::classify(message)) {
                let _ = self.replies.send(reply);
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Session over MCP streamable HTTP.
pub struct StreamableHttpSession {
    inner: Arc<HttpInner>,
    shutdown: CancellationToken,
    listener_started: AtomicBool,
    closed: AtomicBool,
}

impl StreamableHttpSession {
    /// Prepare a session. No traffic happens until the first request.
    pub fn new(
        name: &str,
        client: reqwest::Client,
        url: &str,
        headers: &BTreeMap<String, String>,
        events: EventSink,
    ) -> Result<Self, ProxyError> {
        let url = reqwest::Url::parse(url).map_err(|e| ProxyError::Config {
            reason: format!("server '{name}': invalid url '{url}': {e}"),
        })?;
        let static_headers = header_map(name, headers)?;
        let (dispatcher, mut abandoned) = RpcDispatcher::new(name, events);
        let (replies, mut replies_rx) = mpsc::unbounded_channel::<Value>();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(HttpInner {
            name: name.to_string(),
            client,
            url,
            static_headers,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            dispatcher,
            replies,
        });

        // Poster: replies to server requests and cancellation notices.
        {
            let inner = Arc::clone(&inner);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let body = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        Some(reply) = replies_rx.recv() => reply,
                        Some(id) = abandoned.recv() => {
                            match serde_json::to_value(cancelled_notification(id)) {
                                Ok(body) => body,
                                Err(_) => continue,
                            }
                        }
                        else => break,
                    };
                    if let Err(e) = inner.post(&body).await {
                        tracing::debug!(server = %inner.name, error = %e, "failed to post message");
                    }
                }
            });
        }

        Ok(Self {
            inner,
            shutdown,
            listener_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Open the server-push GET stream once per session.
    fn start_listener(&self) {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = listen(&inner) => {}
            }
        });
    }
}

/// Keep a GET event stream open for server-initiated messages.
async fn listen(inner: &HttpInner) {
    let mut failures = 0;
    while failures < MAX_LISTENER_FAILURES {
        let response = inner
            .client
            .get(inner.url.clone())
            .headers(inner.headers())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await;
        match response {
            Ok(resp)
                if matches!(
                    resp.status(),
                    StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_FOUND
                ) =>
            {
                tracing::debug!(server = %inner.name, "server offers no notification stream");
                return;
            }
            Ok(resp) if resp.status().is_success() && is_event_stream(&resp) => {
                failures = 0;
                let dispatcher = &inner.dispatcher;
                let replies = &inner.replies;
                let pumped = pump_events(resp, |event| route_event(dispatcher, replies, event));
                if let Err(reason) = pumped.await {
                    tracing::debug!(
                        server = %inner.name,
                        reason = %reason,
                        "notification stream failed"
                    );
                }
                failures += 1;
            }
            Ok(resp) => {
                tracing::debug!(
                    server = %inner.name,
                    status = %resp.status(),
                    "notification stream refused"
                );
                failures += 1;
            }
            Err(e) => {
                tracing::debug!(
                    server = %inner.name,
                    error = %e,
                    "notification stream request failed"
                );
                failures += 1;
            }
        }
        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
    }
    tracing::warn!(server = %inner.name, "giving up on notification stream");
}

#[async_trait]
impl Session for StreamableHttpSession {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        let id = next_request_id();
        let pending = self.inner.dispatcher.register(id)?;
        let response = self
            .inner
            .post(&JsonRpcRequest::new(id, method, params))
            .await?;

        let wait = pending.wait();
        tokio::pin!(wait);
        let consume = self.inner.consume(response);
        tokio::pin!(consume);

        let outcome = tokio::select! {
            outcome = &mut wait => outcome,
            consumed = &mut consume => {
                consumed?;
                // The body is exhausted; the response is either here already or never coming.
                match (&mut wait).now_or_never() {
                    Some(outcome) => outcome,
                    None => Err(self.inner.transport_error(format!(
                        "response body ended without an answer to '{method}'"
                    ))),
                }
            }
        };
        let result = extract_result(outcome?)?;

        if method == "initialize" {
            if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
                *lock(&self.inner.protocol_version) = Some(version.to_string());
            }
        }
        Ok(result)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        let response = self
            .inner
            .post(&JsonRpcNotification::new(method, params))
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            self.inner.consume(response).await?;
        }
        if method == "notifications/initialized" {
            self.start_listener();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.dispatcher.close("session closed", false);
        self.shutdown.cancel();

        let has_session = lock(&self.inner.session_id).is_some();
        if has_session {
            let delete = self
                .inner
                .client
                .delete(self.inner.url.clone())
                .headers(self.inner.headers())
                .send();
            match tokio::time::timeout(DELETE_TIMEOUT, delete).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(server = %self.inner.name, error = %e, "session DELETE failed");
                }
                Err(_) => tracing::debug!(server = %self.inner.name, "session DELETE timed out"),
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }
}

impl Drop for StreamableHttpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
