//! `mcp-aggregator [CONFIG]`
//!
//! Serves the aggregated MCP endpoint on stdin/stdout. The config path comes
//! from the first argument, `MCP_AGGREGATOR_CONFIG`, or the nearest
//! `mcp-aggregator.yaml` above the current directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use mcp_aggregator::{config, init_tracing, ConnectOptions, Proxy, ProxyError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    if explicit.as_deref().and_then(|p| p.to_str()) == Some("--version") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cwd = std::env::current_dir().context("failed to read the current directory")?;
    let path = config::find_config_path(explicit.as_deref(), &cwd)?;
    let config =
        config::load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    init_tracing(&config.name, &config.logging)?;
    tracing::info!(
        config = %path.display(),
        servers = config.servers.len(),
        "configuration ready"
    );

    let proxy = Proxy::from_config(&config)?;

    let signal_proxy = Arc::clone(&proxy);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_proxy.close().await;
        }
    });

    let options = ConnectOptions {
        fail_fast: config.connect.fail_fast,
    };
    match proxy.connect_all(options).await {
        Ok(report) => {
            tracing::info!(
                connected = report.connected.len(),
                failed = report.failed.len(),
                "downstream servers settled"
            );
            for (server, cause) in &report.failed {
                tracing::warn!(server = %server, cause = %cause, "server unavailable");
            }
        }
        Err(ProxyError::Cancelled) => {
            tracing::info!("shutdown requested during startup");
            proxy.close().await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = proxy.serve_stdio().await {
        tracing::error!(error = %e, "outward transport failed");
    }

    let report = proxy.close().await;
    if report.is_clean() {
        tracing::info!(closed = report.closed.len(), "proxy closed");
    } else {
        for (server, cause) in &report.failures {
            tracing::warn!(server = %server, cause = %cause, "teardown error");
        }
    }
    Ok(())
}
