//! Collision-naming policy for aggregated identifiers.
//!
//! The first server (in supply order) to report an identifier keeps it bare.
//! Later servers reporting the same identifier get a server-scoped one:
//!
//! - tools and prompts: `{server}__{name}`, with the server name reduced to
//!   `[A-Za-z0-9_-]` so the result stays a valid tool name
//! - resources and templates: `{server}+{uri}`, with the server name reduced
//!   to URI-scheme characters so the result still parses as a URI

use crate::downstream::CapabilityKind;

/// Separator between server and name for tools and prompts.
pub const NAME_SEPARATOR: &str = "__";

/// Separator between server and URI for resources and templates.
pub const URI_SEPARATOR: char = '+';

/// Server name reduced to characters allowed in tool names.
pub fn name_prefix(server: &str) -> String {
    server
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Server name reduced to characters allowed in a URI scheme.
pub fn uri_prefix(server: &str) -> String {
    let prefix: String = server
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    // A scheme must start with a letter.
    if prefix.starts_with(|c: char| c.is_ascii_alphabetic()) {
        prefix
    } else {
        format!("s{prefix}")
    }
}

/// Server-scoped identifier used when `original` is already taken.
pub fn scoped_id(kind: CapabilityKind, server: &str, original: &str) -> String {
    if kind.is_uri() {
        format!("{}{URI_SEPARATOR}{original}", uri_prefix(server))
    } else {
        format!("{}{NAME_SEPARATOR}{original}", name_prefix(server))
    }
}

/// Identifier with a numeric suffix, for when the scoped id is itself taken
/// (e.g. an earlier server reports a tool literally named `github__search`).
pub fn numbered_id(kind: CapabilityKind, scoped: &str, n: usize) -> String {
    if kind.is_uri() {
        // Keep the suffix inside the scheme so the URI body is untouched.
        match scoped.split_once(URI_SEPARATOR) {
            Some((scheme, rest)) => format!("{scheme}{n}{URI_SEPARATOR}{rest}"),
            None => format!("{scoped}{n}"),
        }
    } else {
        format!("{scoped}_{n}")
    }
}

/// Text of a URI template before its first expression.
pub fn literal_prefix(template: &str) -> &str {
    match template.find('{') {
        Some(idx) => &template[..idx],
        None => template,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
