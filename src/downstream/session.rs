//! Session seam between a connection and its wire transport.
//!
//! A [`DownstreamConnection`](super::connection::DownstreamConnection) owns
//! exactly one `Arc<dyn Session>` at a time and knows nothing about pipes or
//! sockets; the [`SessionFactory`] decides how a [`ServerSpec`] becomes a live
//! session. Retry, handshake, and state tracking stay in the connection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};

use super::errors::ProxyError;
use super::http::StreamableHttpSession;
use super::sse::SseSession;
use super::transport::StdioTransport;
use super::types::EventSink;
use crate::descriptor::{ServerSpec, StreamProtocol, TransportDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines of stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Connect timeout for the shared HTTP client.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Traits ──────────────────────────────────────────────────────────────────

/// One live, bidirectional conversation with a downstream server.
#[async_trait]
pub trait Session: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError>;

    /// Send a notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError>;

    /// Tear the session down. Safe to call more than once; only the first
    /// call releases the process or socket.
    async fn close(&self) -> Result<(), ProxyError>;

    /// Whether the session has ended, either by `close` or from the far side.
    fn is_closed(&self) -> bool;

    /// Extra context for failure messages (e.g. recent stderr).
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Opens raw (not yet initialized) sessions for server specs.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        spec: &ServerSpec,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, ProxyError>;
}

// ─── Default Factory ─────────────────────────────────────────────────────────

/// Production factory: spawns processes for stdio specs and uses a shared
/// HTTP client for stream specs.
pub struct TransportFactory {
    http: reqwest::Client,
}

impl TransportFactory {
    /// Build a factory with its own HTTP client.
    pub fn new() -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SessionFactory for TransportFactory {
    async fn open(
        &self,
        spec: &ServerSpec,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, ProxyError> {
        let protocol = spec.transport.effective_stream_protocol();
        match &spec.transport {
            TransportDescriptor::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let session = spawn_stdio(&spec.name, command, args, env, cwd.as_deref(), events)?;
                Ok(Arc::new(session))
            }
            TransportDescriptor::Stream { url, headers, .. } => match protocol {
                Some(StreamProtocol::Sse) => {
                    let session =
                        SseSession::connect(&spec.name, self.http.clone(), url, headers, events)
                            .await?;
                    Ok(Arc::new(session))
                }
                _ => {
                    let session = StreamableHttpSession::new(
                        &spec.name,
                        self.http.clone(),
                        url,
                        headers,
                        events,
                    )?;
                    Ok(Arc::new(session))
                }
            },
        }
    }
}

// ─── Stdio Session ───────────────────────────────────────────────────────────

/// A spawned server process and the transport over its stdio.
pub struct StdioSession {
    name: String,
    transport: StdioTransport,
    process: tokio::sync::Mutex<Option<Child>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Spawn a server process with piped stdio.
///
/// The child is `kill_on_drop`, so an abandoned spawn never outlives its
/// handle.
pub fn spawn_stdio(
    name: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: Option<&str>,
    events: EventSink,
) -> Result<StdioSession, ProxyError> {
    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.envs(env);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ProxyError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{command}: {e}"),
    })?;

    let stdin = child.stdin.take().ok_or(ProxyError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(ProxyError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail)));
    }

    tracing::debug!(server = name, command, pid = child.id(), "spawned server process");

    Ok(StdioSession {
        name: name.to_string(),
        transport: StdioTransport::new(name, stdout, stdin, events),
        process: tokio::sync::Mutex::new(Some(child)),
        stderr_tail,
    })
}

/// Forward stderr lines to the log, keeping the tail for diagnostics.
///
/// Draining also keeps a chatty server from blocking on a full pipe.
async fn drain_stderr(
    server: String,
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, stderr = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[async_trait]
impl Session for StdioSession {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProxyError> {
        self.transport.request(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        self.transport.notify(method, params).await
    }

    async fn close(&self) -> Result<(), ProxyError> {
        // Closing the transport drops stdin; well-behaved servers exit on EOF.
        self.transport.close();

        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "server process exited");
                Ok(())
            }
            _ => {
                tracing::warn!(
                    server = %self.name,
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "server did not exit after stdin closed, killing"
                );
                child.kill().await.map_err(|e| ProxyError::Transport {
                    server: self.name.clone(),
                    reason: format!("failed to kill process: {e}"),
                })
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

/// Format a diagnostics suffix for error messages (empty string if none).
pub fn format_diagnostics_suffix(diagnostics: Option<&str>) -> String {
    match diagnostics.map(str::trim) {
        Some(text) if !text.is_empty() => {
            let mut text = text.to_string();
            if text.len() > 2000 {
                let mut cut = 2000;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
                text.push_str("...(truncated)");
            }
            format!(" | stderr: {text}")
        }
        _ => String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_diagnostics_suffix() {
        assert_eq!(format_diagnostics_suffix(None), "");
        assert_eq!(format_diagnostics_suffix(Some("  ")), "");
        assert_eq!(
            format_diagnostics_suffix(Some("ModuleNotFoundError\n")),
            " | stderr: ModuleNotFoundError"
        );
        let long = "x".repeat(3000);
        assert!(format_diagnostics_suffix(Some(&long)).ends_with("...(truncated)"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = spawn_stdio(
            "ghost",
            "/definitely/not/a/real/binary",
            &[],
            &BTreeMap::new(),
            None,
            tx,
        );
        match result {
            Err(ProxyError::SpawnFailed { name, .. }) => assert_eq!(name, "ghost"),
            Err(other) => panic!("expected SpawnFailed, got {other:?}"),
            Ok(_) => panic!("spawn of a missing binary should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_is_idempotent_and_reaps_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // `cat` exits as soon as stdin closes.
        let session = spawn_stdio("cat", "cat", &[], &BTreeMap::new(), None, tx).unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.process.lock().await.is_none());
    }
}
