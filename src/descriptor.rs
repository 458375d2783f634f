//! Downstream server descriptors.
//!
//! A [`ServerSpec`] names one downstream MCP server and says how to reach it.
//! Specs are supplied wholesale when the proxy is constructed and never change
//! afterwards; a new topology means a new spec list (or an explicit
//! `add_server` / `remove_server`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::downstream::errors::ProxyError;

// ─── Transport Descriptor ────────────────────────────────────────────────────

/// Which HTTP flavour a [`TransportDescriptor::Stream`] speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamProtocol {
    /// Legacy SSE when the URL path ends in `/sse`, streamable HTTP otherwise.
    #[default]
    Auto,
    /// MCP streamable HTTP (POST per message, JSON or SSE bodies).
    StreamableHttp,
    /// Legacy HTTP+SSE (GET event stream plus POST endpoint).
    Sse,
}

/// How to reach one downstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportDescriptor {
    /// Spawn a local process and speak newline-delimited JSON-RPC over its stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Overrides merged over the inherited environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Connect to a remote endpoint over HTTP.
    Stream {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        protocol: StreamProtocol,
    },
}

impl TransportDescriptor {
    /// Shorthand for a stdio descriptor with no env overrides.
    pub fn stdio(
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::Stdio {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Shorthand for a stream descriptor with protocol auto-detection.
    pub fn stream(url: impl Into<String>) -> Self {
        Self::Stream {
            url: url.into(),
            headers: BTreeMap::new(),
            protocol: StreamProtocol::Auto,
        }
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Stream { .. } => "stream",
        }
    }

    /// Resolve [`StreamProtocol::Auto`] against the URL.
    ///
    /// Returns `None` for stdio descriptors.
    pub fn effective_stream_protocol(&self) -> Option<StreamProtocol> {
        let Self::Stream { url, protocol, .. } = self else {
            return None;
        };
        match protocol {
            StreamProtocol::Auto => {
                let path_is_sse = reqwest::Url::parse(url)
                    .map(|u| u.path().trim_end_matches('/').ends_with("/sse"))
                    .unwrap_or(false);
                Some(if path_is_sse {
                    StreamProtocol::Sse
                } else {
                    StreamProtocol::StreamableHttp
                })
            }
            other => Some(*other),
        }
    }

    fn validate(&self, server: &str) -> Result<(), ProxyError> {
        match self {
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ProxyError::Config {
                        reason: format!("server '{server}': stdio command is empty"),
                    });
                }
            }
            Self::Stream { url, headers, .. } => {
                let parsed = reqwest::Url::parse(url).map_err(|e| ProxyError::Config {
                    reason: format!("server '{server}': invalid url '{url}': {e}"),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ProxyError::Config {
                        reason: format!(
                            "server '{server}': url '{url}' must use http or https"
                        ),
                    });
                }
                if let Some(bad) = headers.keys().find(|k| {
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()).is_err()
                }) {
                    return Err(ProxyError::Config {
                        reason: format!("server '{server}': invalid header name '{bad}'"),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio { command, args, .. } if args.is_empty() => write!(f, "stdio:{command}"),
            Self::Stdio { command, args, .. } => write!(f, "stdio:{command} {}", args.join(" ")),
            Self::Stream { url, .. } => write!(f, "stream:{url}"),
        }
    }
}

// ─── ServerSpec ──────────────────────────────────────────────────────────────

/// One configured downstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique within a proxy instance. Used to tag errors and disambiguate names.
    pub name: String,
    pub transport: TransportDescriptor,
}

impl ServerSpec {
    pub fn new(name: impl Into<String>, transport: TransportDescriptor) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    /// Check the spec in isolation (name present, transport well-formed).
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::Config {
                reason: "server name must not be empty".into(),
            });
        }
        self.transport.validate(&self.name)
    }
}

/// Validate a whole spec list: every spec individually plus name uniqueness.
pub fn validate_specs(specs: &[ServerSpec]) -> Result<(), ProxyError> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.name.as_str()) {
            return Err(ProxyError::Config {
                reason: format!("duplicate server name '{}'", spec.name),
            });
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_requires_command() {
        let spec = ServerSpec::new("fs", TransportDescriptor::stdio("  ", Vec::<String>::new()));
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
        assert!(err.to_string().contains("command is empty"));
    }

    #[test]
    fn test_stream_requires_absolute_http_url() {
        let relative = ServerSpec::new("remote", TransportDescriptor::stream("/mcp"));
        assert!(relative.validate().is_err());

        let ftp = ServerSpec::new("remote", TransportDescriptor::stream("ftp://host/mcp"));
        assert!(ftp.validate().unwrap_err().to_string().contains("http or https"));

        let ok = ServerSpec::new("remote", TransportDescriptor::stream("https://host/mcp"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let specs = vec![
            ServerSpec::new("a", TransportDescriptor::stdio("echo", ["x"])),
            ServerSpec::new("a", TransportDescriptor::stdio("echo", ["y"])),
        ];
        let err = validate_specs(&specs).unwrap_err();
        assert!(err.to_string().contains("duplicate server name 'a'"));
    }

    #[test]
    fn test_auto_protocol_detection() {
        let sse = TransportDescriptor::stream("http://localhost:3000/sse");
        assert_eq!(sse.effective_stream_protocol(), Some(StreamProtocol::Sse));

        let http = TransportDescriptor::stream("http://localhost:3000/mcp");
        assert_eq!(
            http.effective_stream_protocol(),
            Some(StreamProtocol::StreamableHttp)
        );

        let stdio = TransportDescriptor::stdio("npx", ["server"]);
        assert_eq!(stdio.effective_stream_protocol(), None);
    }

    #[test]
    fn test_tagged_deserialization() {
        let yaml = r#"
            - name: files
              transport:
                type: stdio
                command: npx
                args: ["-y", "@modelcontextprotocol/server-filesystem"]
                env:
                  ROOT: /tmp
            - name: search
              transport:
                type: stream
                url: https://search.example.com/mcp
                headers:
                  Authorization: Bearer abc
        "#;
        let specs: Vec<ServerSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 2);
        match &specs[0].transport {
            TransportDescriptor::Stdio { command, args, env, cwd } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert_eq!(env.get("ROOT").map(String::as_str), Some("/tmp"));
                assert!(cwd.is_none());
            }
            other => panic!("expected stdio, got {other:?}"),
        }
        assert_eq!(specs[1].transport.kind(), "stream");
        assert!(validate_specs(&specs).is_ok());
    }
}
