//! Server-sent events: the event parser shared by both HTTP transports, and
//! the legacy HTTP+SSE session.
//!
//! Legacy SSE works in two halves: a long-lived `GET` event stream that first
//! announces an `endpoint` and then carries every server→client message, and
//! plain `POST`s of client→server messages to that endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::errors::ProxyError;
use super::session::Session;
use super::transport::{cancelled_notification, extract_result, next_request_id, RpcDispatcher};
use super::types::{EventSink, IncomingMessage, JsonRpcNotification, JsonRpcRequest};

/// How long to wait for the `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(15);

// ─── Event Parser ────────────────────────────────────────────────────────────

/// A parsed SSE event from a `text/event-stream` body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    /// The `id:` field.
    pub id: Option<String>,
    /// The `event:` field (event type). `None` means the default `message`.
    pub event: Option<String>,
    /// The `data:` field (accumulated across multiple `data:` lines).
    pub data: String,
}

impl SseEvent {
    /// Whether this event carries a JSON-RPC message.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental decoder: feed arbitrary byte chunks, get back complete events.
///
/// Bytes are buffered until an event boundary, so a UTF-8 sequence split
/// across chunks is decoded whole.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every event completed by it.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<SseEvent> {
        // CR never appears unescaped inside a JSON payload, so dropping it
        // normalizes CRLF even when the pair straddles two chunks.
        self.buffer
            .extend(chunk.as_ref().iter().copied().filter(|&b| b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event(&String::from_utf8_lossy(&raw)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event left unterminated when the stream ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buffer);
        parse_event(&String::from_utf8_lossy(&raw))
    }
}

/// Parse one raw event block. Blocks with no `data:` field yield `None`.
fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;

    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            // `retry` and unknown fields are ignored.
            _ => {}
        }
    }

    has_data.then_some(event)
}

/// Read an event-stream response to its end, handing every event to `on_event`.
///
/// Returns `Err` with a reason when the body fails mid-stream.
pub async fn pump_events<F>(response: reqwest::Response, mut on_event: F) -> Result<(), String>
where
    F: FnMut(SseEvent),
{
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = body.next().await {
        let bytes = chunk.map_err(|e| format!("stream read error: {e}"))?;
        for event in decoder.push(&bytes) {
            on_event(event);
        }
    }
    if let Some(event) = decoder.finish() {
        on_event(event);
    }
    Ok(())
}

/// Route a message-bearing event through a dispatcher, queueing any reply.
pub fn route_event(
    dispatcher: &RpcDispatcher,
    replies: &mpsc::UnboundedSender<Value>,
    event: SseEvent,
) {
    if !event.is_message() {
        return;
    }
    let message = IncomingMessage::parse(&event.data);
    if matches!(message, IncomingMessage::Invalid) {
        tracing::debug!(
            server = %dispatcher.server_name(),
            data = %event.data,
            "ignoring malformed SSE message"
        );
        return;
    }
    if let Some(reply) = dispatcher.dispatch(message) {
        let _ = replies.send(reply);
    }
}

/// Convert configured headers into a `HeaderMap`.
pub fn header_map(
    server: &str,
    headers: &BTreeMap<String, String>,
) -> Result<HeaderMap, ProxyError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| ProxyError::Config {
            reason: format!("server '{server}': invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| ProxyError::Config {
            reason: format!("server '{server}': invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Whether a response body is an SSE stream.
pub fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

// ─── Legacy SSE Session ──────────────────────────────────────────────────────

struct SseInner {
    name: String,
    client: reqwest::Client,
    endpoint: reqwest::Url,
    headers: HeaderMap,
    dispatcher: Arc<RpcDispatcher>,
}

impl SseInner {
    async fn post(&self, body: &impl serde::Serialize) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| ProxyError::Transport {
                server: self.name.clone(),
                reason: format!("POST {} failed: {e}", self.endpoint),
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::Transport {
                server: self.name.clone(),
                reason: format!("POST {} returned HTTP {status}: {text}", self.endpoint),
            });
        }
        Ok(())
    }
}

/// Session over the legacy HTTP+SSE transport.
pub struct SseSession {
    inner: Arc<SseInner>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl SseSession {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn connect(
        name: &str,
        client: reqwest::Client,
        url: &str,
        headers: &BTreeMap<String, String>,
        events: EventSink,
    ) -> Result<Self, ProxyError> {
        let base = reqwest::Url::parse(url).map_err(|e| ProxyError::Config {
            reason: format!("server '{name}': invalid url '{url}': {e}"),
        })?;
        let headers = header_map(name, headers)?;

        let response = client
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ProxyError::Transport {
                server: name.to_string(),
                reason: format!("GET {base} failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(ProxyError::Transport {
                server: name.to_string(),
                reason: format!("GET {base} returned HTTP {}", response.status()),
            });
        }
        if !is_event_stream(&response) {
            return Err(ProxyError::Transport {
                server: name.to_string(),
                reason: format!("GET {base} did not return an event stream"),
            });
        }

        let (dispatcher, mut abandoned) = RpcDispatcher::new(name, events);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<Value>();
        let shutdown = CancellationToken::new();
        // Until the endpoint is known, leaving this function any way but `Ok`
        // (including being dropped mid-await) stops the reader.
        let stop_reader = shutdown.clone().drop_guard();

        // Reader: the stream lives exactly as long as this task.
        {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = shutdown.clone();
            let replies = replies_tx.clone();
            tokio::spawn(async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let pump = pump_events(response, |event| {
                    if event.event.as_deref() == Some("endpoint") {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(event.data.trim().to_string());
                        }
                        return;
                    }
                    route_event(&dispatcher, &replies, event);
                });
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    outcome = pump => outcome,
                };
                let reason = match outcome {
                    Ok(()) => "event stream ended".to_string(),
                    Err(reason) => reason,
                };
                dispatcher.close(&reason, true);
            });
        }

        let announced = tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx)
            .await
            .map_err(|_| ProxyError::Transport {
                server: name.to_string(),
                reason: format!("no endpoint event within {}s", ENDPOINT_TIMEOUT.as_secs()),
            })?
            .map_err(|_| ProxyError::Transport {
                server: name.to_string(),
                reason: "event stream ended before announcing an endpoint".into(),
            })?;
        let endpoint = base.join(&announced).map_err(|e| ProxyError::Transport {
            server: name.to_string(),
            reason: format!("invalid endpoint '{announced}': {e}"),
        })?;
        tracing::debug!(server = name, %endpoint, "SSE endpoint announced");

        let inner = Arc::new(SseInner {
            name: name.to_string(),
            client,
            endpoint,
            headers,
            dispatcher,
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

        stop_reader.disarm();
        Ok(Self {
            inner,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Session for SseSession {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        let id = next_request_id();
        let pending = self.inner.dispatcher.register(id)?;
        self.inner
            .post(&JsonRpcRequest::new(id, method, params))
            .await?;
        extract_result(pending.wait().await?)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        self.inner
            .post(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn close(&self) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.dispatcher.close("session closed", false);
        self.shutdown.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("event: endpoint\ndata: /messages?session=abc\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session=abc");
        assert!(!events[0].is_message());
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: {\"jsonrpc\":").is_empty());
        let events = decoder.push("\"2.0\"}\n\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
        assert!(events[0].is_message());
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_multiline_data_comments_and_crlf() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(": keep-alive\r\n\r\nid: 7\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"t\":\"caf\xC3").is_empty());
        let events = decoder.push(b"\xA9\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"t\":\"caf\u{e9}\"}");
        let parsed: Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(parsed["t"], "caf\u{e9}");
    }

    #[test]
    fn test_crlf_boundary_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: x\r\n\r").is_empty());
        let events = decoder.push("\ndata: y\r\n\r\n");
        assert_eq!(events.iter().map(|e| e.data.as_str()).collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: tail").is_empty());
        assert_eq!(decoder.finish().map(|e| e.data), Some("tail".to_string()));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_route_event_answers_ping() {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (dispatcher, _abandoned) = RpcDispatcher::new("remote", events);
        let (replies, mut replies_rx) = mpsc::unbounded_channel();
        route_event(
            &dispatcher,
            &replies,
            SseEvent {
                id: None,
                event: Some("message".into()),
                data: r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.into(),
            },
        );
        let reply = replies_rx.try_recv().unwrap();
        assert_eq!(reply["id"], 1);
    }

    #[tokio::test]
    async fn test_abandoned_connect_hangs_up_event_stream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Opens the event stream but never announces an endpoint.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let head: &[u8] = b"HTTP/1.1 200 OK\r\n\
                content-type: text/event-stream\r\n\
                transfer-encoding: chunked\r\n\r\n";
            socket.write_all(head).await.unwrap();
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        });

        let (events, _events_rx) = mpsc::unbounded_channel();
        let url = format!("http://{addr}/sse");
        let attempt = tokio::time::timeout(
            Duration::from_millis(200),
            SseSession::connect("stalled", reqwest::Client::new(), &url, &BTreeMap::new(), events),
        )
        .await;
        assert!(attempt.is_err());

        let hung_up = tokio::time::timeout(Duration::from_secs(2), server).await;
        assert!(hung_up.is_ok(), "event stream stayed open after connect was dropped");
    }

    #[test]
    fn test_header_map_rejects_bad_value() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer ok".to_string());
        assert_eq!(header_map("s", &headers).unwrap().len(), 1);

        headers.insert("X-Bad".to_string(), "line\nbreak".to_string());
        assert!(header_map("s", &headers).is_err());
    }
}
