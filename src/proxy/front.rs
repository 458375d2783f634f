//! Proxy front: the single MCP server surface exposed to outward clients.
//!
//! A front speaks newline-delimited JSON-RPC over any `AsyncRead`/`AsyncWrite`
//! pair. Every inbound request runs in its own task, so a slow downstream
//! never stalls requests bound for another. `notifications/cancelled` aborts
//! the matching task, and dropping its future cancels the downstream request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::Proxy;
use crate::downstream::types::{
    error_codes, response_err, response_ok, IncomingMessage, JsonRpcError, JsonRpcNotification,
};
use crate::downstream::ProxyError;

type Inflight = Arc<Mutex<HashMap<String, AbortHandle>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ─── ProxyFront ──────────────────────────────────────────────────────────────

/// One attached outward client.
pub struct ProxyFront {
    id: Uuid,
    proxy: Arc<Proxy>,
}

impl ProxyFront {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proxy,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve until the client closes its side or the proxy shuts down.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_loop(self.id, writer, out_rx));
        let inflight: Inflight = Arc::new(Mutex::new(HashMap::new()));
        let mut outward = self.proxy.subscribe_outward();
        let shutdown = self.proxy.shutdown_token();
        let mut lines = BufReader::new(reader).lines();

        tracing::info!(client = %self.id, "outward client attached");

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                note = outward.recv() => match note {
                    Ok(note) if note.audience.includes(self.id) => {
                        let line = encode(&JsonRpcNotification::new(&note.method, note.params));
                        let _ = out_tx.send(line);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            client = %self.id,
                            skipped,
                            "outward client lagging, notifications dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line, &out_tx, &inflight),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(ProxyError::Transport {
                        server: "outward".into(),
                        reason: format!("failed to read from client: {e}"),
                    }),
                },
            }
        };

        let pending: Vec<AbortHandle> = lock(&inflight).drain().map(|(_, handle)| handle).collect();
        for handle in pending {
            handle.abort();
        }
        self.proxy.drop_client(self.id).await;
        drop(out_tx);
        if let Err(e) = writer_task.await {
            tracing::debug!(client = %self.id, error = %e, "writer task ended abnormally");
        }

        tracing::info!(client = %self.id, "outward client detached");
        outcome
    }

    fn handle_line(&self, line: &str, out: &mpsc::UnboundedSender<String>, inflight: &Inflight) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                let error = rpc_error(error_codes::PARSE_ERROR, format!("parse error: {e}"));
                let _ = out.send(response_err(Value::Null, &error).to_string());
                return;
            }
        };
        if value.is_array() {
            let error = rpc_error(
                error_codes::INVALID_REQUEST,
                "batch requests are not supported".into(),
            );
            let _ = out.send(response_err(Value::Null, &error).to_string());
            return;
        }

        match IncomingMessage::classify(value) {
            IncomingMessage::Request { id, method, params } => {
                self.spawn_request(id, method, params, out.clone(), inflight);
            }
            IncomingMessage::Notification { method, params } => {
                self.handle_notification(&method, params.as_ref(), inflight);
            }
            IncomingMessage::Response(_) => {
                tracing::debug!(client = %self.id, "ignoring response from outward client");
            }
            IncomingMessage::Invalid => {
                let error =
                    rpc_error(error_codes::INVALID_REQUEST, "invalid JSON-RPC message".into());
                let _ = out.send(response_err(Value::Null, &error).to_string());
            }
        }
    }

    fn spawn_request(
        &self,
        id: Value,
        method: String,
        params: Option<Value>,
        out: mpsc::UnboundedSender<String>,
        inflight: &Inflight,
    ) {
        let key = id.to_string();
        let proxy = Arc::clone(&self.proxy);
        let client = self.id;
        let registry = Arc::clone(inflight);

        // Holding the lock across spawn keeps the task's own removal ordered
        // after its insertion.
        let mut table = lock(inflight);
        let task_key = key.clone();
        let handle: JoinHandle<()> = tokio::spawn(async move {
            let reply = match dispatch(&proxy, client, &method, params).await {
                Ok(result) => response_ok(id, result),
                Err(e) => {
                    tracing::debug!(
                        client = %client,
                        method = %method,
                        error = %e,
                        "request failed"
                    );
                    response_err(id, &e.to_json_rpc())
                }
            };
            lock(&registry).remove(&task_key);
            let _ = out.send(reply.to_string());
        });
        table.insert(key, handle.abort_handle());
    }

    fn handle_notification(&self, method: &str, params: Option<&Value>, inflight: &Inflight) {
        match method {
            "notifications/cancelled" => {
                let Some(request_id) = params.and_then(|p| p.get("requestId")) else {
                    return;
                };
                if let Some(handle) = lock(inflight).remove(&request_id.to_string()) {
                    handle.abort();
                    tracing::debug!(
                        client = %self.id,
                        request_id = %request_id,
                        "request cancelled by client"
                    );
                }
            }
            "notifications/initialized" => {
                tracing::debug!(client = %self.id, "outward client initialized");
            }
            other => {
                tracing::trace!(client = %self.id, method = other, "ignoring client notification");
            }
        }
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

async fn dispatch(
    proxy: &Proxy,
    client: Uuid,
    method: &str,
    params: Option<Value>,
) -> Result<Value, ProxyError> {
    match method {
        "initialize" => Ok(proxy.initialize_result(params.as_ref())),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": proxy.catalog().tools.items() })),
        "resources/list" => Ok(json!({ "resources": proxy.catalog().resources.items() })),
        "resources/templates/list" => Ok(json!({
            "resourceTemplates": proxy.catalog().templates.items()
        })),
        "prompts/list" => Ok(json!({ "prompts": proxy.catalog().prompts.items() })),
        "tools/call" => {
            let name = required_str(params.as_ref(), "name")?;
            let arguments = params.as_ref().and_then(|p| p.get("arguments")).cloned();
            proxy.call_tool(&name, arguments).await
        }
        "resources/read" => {
            let uri = required_str(params.as_ref(), "uri")?;
            proxy.read_resource(&uri).await
        }
        "resources/subscribe" => {
            let uri = required_str(params.as_ref(), "uri")?;
            proxy.subscribe(client, &uri).await.map(|()| json!({}))
        }
        "resources/unsubscribe" => {
            let uri = required_str(params.as_ref(), "uri")?;
            proxy.unsubscribe(client, &uri).await.map(|()| json!({}))
        }
        "prompts/get" => {
            let name = required_str(params.as_ref(), "name")?;
            let arguments = params.as_ref().and_then(|p| p.get("arguments")).cloned();
            proxy.get_prompt(&name, arguments).await
        }
        "completion/complete" => {
            let params = params.ok_or_else(|| ProxyError::InvalidParams {
                reason: "params are required".into(),
            })?;
            proxy.complete(params).await
        }
        "logging/setLevel" => Ok(json!({})),
        other => Err(ProxyError::MethodNotFound {
            method: other.to_string(),
        }),
    }
}

fn required_str(params: Option<&Value>, key: &str) -> Result<String, ProxyError> {
    params
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProxyError::InvalidParams {
            reason: format!("missing string parameter '{key}'"),
        })
}

fn rpc_error(code: i32, message: String) -> JsonRpcError {
    JsonRpcError {
        code,
        message,
        data: None,
    }
}

fn encode<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_default()
}

async fn write_loop<W>(client: Uuid, mut writer: W, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            tracing::debug!(client = %client, error = %e, "failed to write to outward client");
            break;
        }
    }
}

// ─── Proxy entry points ──────────────────────────────────────────────────────

impl Proxy {
    /// Attach an outward transport and serve it on a background task.
    pub fn attach_transport<R, W>(
        self: &Arc<Self>,
        reader: R,
        writer: W,
    ) -> JoinHandle<Result<(), ProxyError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let front = ProxyFront::new(Arc::clone(self));
        tokio::spawn(front.serve(reader, writer))
    }

    /// Serve the process's stdin/stdout until EOF or shutdown.
    pub async fn serve_stdio(self: &Arc<Self>) -> Result<(), ProxyError> {
        ProxyFront::new(Arc::clone(self))
            .serve(tokio::io::stdin(), tokio::io::stdout())
            .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
