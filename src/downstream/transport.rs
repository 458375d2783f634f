//! JSON-RPC plumbing shared by every downstream transport, plus the stdio
//! transport itself.
//!
//! - [`RpcDispatcher`] matches responses to waiting requests by id, forwards
//!   notifications to the proxy, and answers the few server-initiated requests
//!   a proxy client must handle (`ping`, `roots/list`).
//! - [`StdioTransport`] frames messages as newline-delimited JSON over any
//!   async byte pipe (a child's stdin/stdout in production, a duplex in tests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::errors::ProxyError;
use super::types::{
    error_codes, response_err, response_ok, DownstreamEvent, DownstreamEventKind, EventSink,
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

struct PendingTable {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    /// Set once; every later `register` fails with this reason.
    closed: Option<String>,
}

/// Routes incoming frames for one session.
pub struct RpcDispatcher {
    server_name: String,
    table: Mutex<PendingTable>,
    events: EventSink,
    /// Ids of requests whose caller stopped waiting.
    abandoned: mpsc::UnboundedSender<u64>,
}

impl RpcDispatcher {
    /// Create a dispatcher and the receiver of abandoned request ids.
    ///
    /// The transport owning the dispatcher drains the receiver and tells the
    /// peer via `notifications/cancelled`.
    pub fn new(server_name: &str, events: EventSink) -> (Arc<Self>, mpsc::UnboundedReceiver<u64>) {
        let (abandoned, abandoned_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            server_name: server_name.to_string(),
            table: Mutex::new(PendingTable {
                waiters: HashMap::new(),
                closed: None,
            }),
            events,
            abandoned,
        });
        (dispatcher, abandoned_rx)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn closed_error(&self, reason: &str) -> ProxyError {
        ProxyError::Transport {
            server: self.server_name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Register a waiter for a response with `id`.
    pub fn register(self: &Arc<Self>, id: u64) -> Result<PendingRequest, ProxyError> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(self.closed_error(reason));
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        Ok(PendingRequest {
            id,
            rx,
            dispatcher: Arc::clone(self),
            finished: false,
        })
    }

    /// Whether the session has been closed (by us or by the peer).
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn abandon(&self, id: u64) {
        let removed = self.lock().waiters.remove(&id).is_some();
        if removed {
            let _ = self.abandoned.send(id);
        }
    }

    /// Route one classified message.
    ///
    /// Returns the reply to send back when the peer issued a request.
    pub fn dispatch(&self, message: IncomingMessage) -> Option<Value> {
        match message {
            IncomingMessage::Response(resp) => {
                let waiter = self.lock().waiters.remove(&resp.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => tracing::debug!(
                        server = %self.server_name,
                        id = resp.id,
                        "response for unknown or abandoned request"
                    ),
                }
                None
            }
            IncomingMessage::Notification { method, params } => {
                let _ = self.events.send(DownstreamEvent {
                    server: self.server_name.clone(),
                    kind: DownstreamEventKind::Notification { method, params },
                });
                None
            }
            IncomingMessage::Request { id, method, .. } => Some(match method.as_str() {
                "ping" => response_ok(id, serde_json::json!({})),
                "roots/list" => response_ok(id, serde_json::json!({ "roots": [] })),
                _ => {
                    tracing::debug!(
                        server = %self.server_name,
                        method = %method,
                        "rejecting server-initiated request"
                    );
                    response_err(
                        id,
                        &JsonRpcError {
                            code: error_codes::METHOD_NOT_FOUND,
                            message: format!("method '{method}' is not supported by this client"),
                            data: None,
                        },
                    )
                }
            }),
            IncomingMessage::Invalid => None,
        }
    }

    /// Fail every waiting request and refuse new ones.
    ///
    /// `report` emits a `Closed` event; it is set when the peer went away on
    /// its own and cleared for an intentional close. Only the first call has
    /// any effect.
    pub fn close(&self, reason: &str, report: bool) {
        {
            let mut table = self.lock();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.to_string());
            // Dropping the senders wakes every waiter with an error.
            table.waiters.clear();
        }
        if report {
            tracing::warn!(server = %self.server_name, reason, "downstream session closed");
            let _ = self.events.send(DownstreamEvent {
                server: self.server_name.clone(),
                kind: DownstreamEventKind::Closed {
                    reason: reason.to_string(),
                },
            });
        }
    }

    fn close_reason(&self) -> String {
        self.lock()
            .closed
            .clone()
            .unwrap_or_else(|| "response channel dropped".into())
    }
}

/// A request waiting for its response.
///
/// Dropping it before the response arrives abandons the request and notifies
/// the peer, which is how per-request cancellation reaches the downstream.
pub struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    dispatcher: Arc<RpcDispatcher>,
    finished: bool,
}

impl PendingRequest {
    /// Wait for the matching response.
    pub async fn wait(mut self) -> Result<JsonRpcResponse, ProxyError> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        outcome.map_err(|_| self.dispatcher.closed_error(&self.dispatcher.close_reason()))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.dispatcher.abandon(self.id);
        }
    }
}

/// Serialize a `notifications/cancelled` for an abandoned request id.
pub fn cancelled_notification(id: u64) -> JsonRpcNotification {
    JsonRpcNotification::new(
        "notifications/cancelled",
        Some(serde_json::json!({ "requestId": id, "reason": "request cancelled by client" })),
    )
}

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a byte pipe.
///
/// A writer task owns the write half and serializes every outgoing frame; a
/// reader task owns the read half and feeds the dispatcher.
pub struct StdioTransport {
    dispatcher: Arc<RpcDispatcher>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Create a new transport from a read half and a write half.
    pub fn new<R, W>(server_name: &str, reader: R, writer: W, events: EventSink) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (dispatcher, abandoned_rx) = RpcDispatcher::new(server_name, events);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(
            Arc::clone(&dispatcher),
            writer,
            outbound_rx,
            abandoned_rx,
            shutdown.clone(),
        ));
        tokio::spawn(read_loop(
            Arc::clone(&dispatcher),
            reader,
            outbound.clone(),
            shutdown.clone(),
        ));

        Self {
            dispatcher,
            outbound,
            shutdown,
        }
    }

    fn send_line<T: serde::Serialize>(&self, message: &T) -> Result<(), ProxyError> {
        let mut json = serde_json::to_string(message).map_err(|e| ProxyError::Transport {
            server: self.dispatcher.server_name().to_string(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');
        self.outbound.send(json).map_err(|_| ProxyError::Transport {
            server: self.dispatcher.server_name().to_string(),
            reason: "writer closed".into(),
        })
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        let id = next_request_id();
        let pending = self.dispatcher.register(id)?;
        self.send_line(&JsonRpcRequest::new(id, method, params))?;
        extract_result(pending.wait().await?)
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        if self.dispatcher.is_closed() {
            return Err(ProxyError::Transport {
                server: self.dispatcher.server_name().to_string(),
                reason: "session closed".into(),
            });
        }
        self.send_line(&JsonRpcNotification::new(method, params))
    }

    /// Stop both loops. The write half is dropped, which closes the pipe.
    pub fn close(&self) {
        self.dispatcher.close("session closed", false);
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop<W>(
    dispatcher: Arc<RpcDispatcher>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut abandoned: mpsc::UnboundedReceiver<u64>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(id) = abandoned.recv() => {
                match serde_json::to_string(&cancelled_notification(id)) {
                    Ok(mut json) => {
                        json.push('\n');
                        json
                    }
                    Err(_) => continue,
                }
            }
            next = outbound.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            dispatcher.close(&format!("failed to write to stdin: {e}"), true);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    dispatcher: Arc<RpcDispatcher>,
    reader: R,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let message = IncomingMessage::parse(trimmed);
                if matches!(message, IncomingMessage::Invalid) {
                    // Not JSON-RPC, usually log output on stdout.
                    tracing::trace!(
                        server = %dispatcher.server_name(),
                        line = trimmed,
                        "skipping non-JSON-RPC line"
                    );
                    continue;
                }
                if let Some(reply) = dispatcher.dispatch(message) {
                    let _ = outbound.send(format!("{reply}\n"));
                }
            }
            Ok(None) => {
                dispatcher.close("server stdout closed (process may have exited)", true);
                break;
            }
            Err(e) => {
                dispatcher.close(&format!("failed to read from stdout: {e}"), true);
                break;
            }
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to [`ProxyError::Rpc`].
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, ProxyError> {
    if let Some(err) = response.error {
        return Err(ProxyError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(ProxyError::Rpc {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
