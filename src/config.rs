//! Proxy configuration loading and validation.
//!
//! Reads `mcp-aggregator.yaml` (or `.yml` / `.json`) and resolves environment
//! variables. The file is the single source of the downstream server list,
//! the connect policy, and logging settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::descriptor::{validate_specs, ServerSpec};
use crate::downstream::{ConnectionOptions, ProxyError, RetryPolicy};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_AGGREGATOR_CONFIG";

/// File names searched for, in order, in each directory walked.
pub const CONFIG_FILE_NAMES: [&str; 3] = [
    "mcp-aggregator.yaml",
    "mcp-aggregator.yml",
    "mcp-aggregator.json",
];

/// Default tracing filter when neither the config nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_FILTER: &str = "mcp_aggregator=info,warn";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `mcp-aggregator.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Name reported to outward clients in `serverInfo`.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection policy shared by every downstream server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Strict startup: any server failing to connect aborts the proxy.
    pub fail_fast: bool,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub init_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_attempts: 3,
            retry_delay_ms: 2500,
            init_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl ConnectConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                delay: Duration::from_millis(self.retry_delay_ms),
            },
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Where and how logs are written. Stdout always carries the protocol, so
/// logs go to stderr unless a file or directory is given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence when set.
    pub filter: Option<String>,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Explicit log file path.
    pub file: Option<String>,
    /// Directory holding `{proxy name}.log`. Ignored when `file` is set.
    pub dir: Option<String>,
    /// Rotated generations kept next to the active log on startup.
    pub keep: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            json: false,
            file: None,
            dir: None,
            keep: 3,
        }
    }
}

impl LoggingConfig {
    pub fn filter_or_default(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Active log file for the proxy called `proxy_name`, `~` expanded.
    ///
    /// Several proxies sharing one `dir` each get their own rotation chain.
    pub fn file_path(&self, proxy_name: &str) -> Option<PathBuf> {
        if let Some(file) = self.file.as_deref() {
            return Some(PathBuf::from(expand_tilde(file)));
        }
        let dir = PathBuf::from(expand_tilde(self.dir.as_deref()?));
        let stem: String = proxy_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Some(dir.join(format!("{stem}.log")))
    }
}

fn default_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

impl ProxyConfig {
    /// Reject malformed configuration before any connection attempt.
    ///
    /// An empty server list is valid: the proxy then serves empty tables.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::Config {
                reason: "proxy name must not be empty".into(),
            });
        }
        if self.connect.max_attempts == 0 {
            return Err(ProxyError::Config {
                reason: "connect.max_attempts must be at least 1".into(),
            });
        }
        if self.connect.init_timeout_ms == 0 || self.connect.request_timeout_ms == 0 {
            return Err(ProxyError::Config {
                reason: "connect timeouts must be greater than zero".into(),
            });
        }
        validate_specs(&self.servers)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to load.
///
/// Order: the explicit path, then `MCP_AGGREGATOR_CONFIG`, then a walk upward
/// from `start` looking for [`CONFIG_FILE_NAMES`].
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<PathBuf, ProxyError> {
    // 1. Explicit argument
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ProxyError::Config {
            reason: format!("config file {} does not exist", path.display()),
        });
    }

    // 2. Env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(ProxyError::Config {
            reason: format!(
                "{CONFIG_ENV_VAR} points at {}, which does not exist",
                candidate.display()
            ),
        });
    }

    // 3. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ProxyError::Config {
        reason: format!(
            "could not find {} in {} or any parent directory",
            CONFIG_FILE_NAMES[0],
            start.display()
        ),
    })
}

/// Load, interpolate, parse, and validate a config file.
///
/// Environment variables are resolved on the raw text, so `${VAR}` and
/// `${VAR:-default}` work anywhere in the file. JSON files parse too, since
/// YAML is a superset.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ProxyError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ProxyError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse and validate config text.
pub fn parse_config(raw: &str) -> Result<ProxyConfig, ProxyError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ProxyConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ProxyError::Config {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    tracing::debug!(
        name = %config.name,
        servers = config.servers.len(),
        fail_fast = config.connect.fail_fast,
        "configuration loaded"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                expr.push(c);
            }
            if closed {
                result.push_str(&resolve_var_expr(&expr));
            } else {
                // Unterminated: keep the text as written.
                result.push_str("${");
                result.push_str(&expr);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
