//! MCP aggregation proxy.
//!
//! Presents a single MCP server endpoint while fanning out to any number of
//! downstream MCP servers (stdio subprocesses or HTTP/SSE endpoints). Their
//! tools, resources, prompts, and resource templates are merged into one
//! namespace and every request is routed back to the owning server.
//!
//! - [`descriptor`]: how to reach one downstream server
//! - [`downstream`]: sessions and retrying connections
//! - [`aggregator`]: routing tables and the collision-naming policy
//! - [`proxy`]: lifecycle coordinator and the outward MCP surface
//! - [`config`]: YAML/JSON configuration with env-var interpolation

pub mod aggregator;
pub mod config;
pub mod descriptor;
pub mod downstream;
pub mod proxy;

use std::fs;
use std::io::LineWriter;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use config::{load_config, ProxyConfig};
pub use descriptor::{ServerSpec, TransportDescriptor};
pub use downstream::ProxyError;
pub use proxy::{CloseReport, ConnectOptions, ConnectReport, Proxy};

/// Initialize the tracing subscriber for the proxy called `proxy_name`.
///
/// Logs go to stderr unless the config names a file or directory, because
/// stdout carries the protocol. A log file is rotated first (see
/// [`rotate_logs`]) and then written a line at a time, so a proxy killed by
/// its parent still leaves complete records behind.
///
/// `RUST_LOG` overrides the configured filter.
pub fn init_tracing(proxy_name: &str, logging: &config::LoggingConfig) -> Result<(), ProxyError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let log_path = logging.file_path(proxy_name);
    let writer = match &log_path {
        Some(path) => BoxMakeWriter::new(Mutex::new(open_log(path, logging.keep)?)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_or_default()));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ProxyError::Config {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    tracing::info!(
        proxy = %proxy_name,
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== mcp-aggregator starting ==="
    );
    Ok(())
}

/// Rotate the logs at `path`, then open a fresh one.
fn open_log(path: &Path, keep: u32) -> Result<LineWriter<fs::File>, ProxyError> {
    let config_error = |what: &str, at: &Path, e: std::io::Error| ProxyError::Config {
        reason: format!("failed to {what} {}: {e}", at.display()),
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| config_error("create log directory", dir, e))?;
    }
    rotate_logs(path, keep);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| config_error("open log file", path, e))?;
    Ok(LineWriter::new(file))
}

/// `team.log` → `team.log.{generation}`.
fn rotated_path(path: &Path, generation: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift `path` into `path.1`, `path.1` into `path.2`, and so on, keeping
/// `keep` generations. With `keep == 0` the old log is simply discarded.
///
/// Best effort: a generation that cannot be moved is left where it is.
fn rotate_logs(path: &Path, keep: u32) {
    if keep == 0 {
        let _ = fs::remove_file(path);
        return;
    }
    let _ = fs::remove_file(rotated_path(path, keep));
    for generation in (1..=keep).rev() {
        let source = match generation {
            1 => path.to_path_buf(),
            n => rotated_path(path, n - 1),
        };
        if source.exists() {
            let _ = fs::rename(&source, rotated_path(path, generation));
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
