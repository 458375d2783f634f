//! Routing table for one capability kind.

use std::collections::HashMap;
use std::sync::Arc;

use super::naming;
use crate::downstream::{Capability, DownstreamConnection, ProxyError, ResourceTemplate};

/// One externally visible capability and the connection that owns it.
#[derive(Debug, Clone)]
pub struct CapabilityEntry<T> {
    pub external_id: String,
    /// Identifier as reported by the downstream server.
    pub original_id: String,
    pub owner: Arc<DownstreamConnection>,
    /// Downstream metadata with its identifier rewritten to `external_id`.
    pub item: T,
}

/// `external_id → entry` for one capability kind, in insertion order.
#[derive(Debug, Clone)]
pub struct RoutingTable<T> {
    entries: Vec<CapabilityEntry<T>>,
    index: HashMap<String, usize>,
}

impl<T> Default for RoutingTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Capability> RoutingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item reported by `owner`, assigning its external identifier.
    ///
    /// Entries must be inserted in server supply order for assignments to be
    /// stable across rebuilds.
    pub fn insert(
        &mut self,
        owner: &Arc<DownstreamConnection>,
        mut item: T,
    ) -> &CapabilityEntry<T> {
        let original_id = item.id().to_string();
        let external_id = self.assign_id(owner.name(), &original_id);
        if external_id != original_id {
            tracing::debug!(
                server = %owner.name(),
                kind = %T::KIND,
                original = %original_id,
                external = %external_id,
                "renamed colliding capability"
            );
        }
        item.set_id(external_id.clone());

        let slot = self.entries.len();
        self.index.insert(external_id.clone(), slot);
        self.entries.push(CapabilityEntry {
            external_id,
            original_id,
            owner: Arc::clone(owner),
            item,
        });
        &self.entries[slot]
    }

    fn assign_id(&self, server: &str, original: &str) -> String {
        if !self.index.contains_key(original) {
            return original.to_string();
        }
        let scoped = naming::scoped_id(T::KIND, server, original);
        if !self.index.contains_key(&scoped) {
            return scoped;
        }
        let numbered = (2..)
            .map(|n| naming::numbered_id(T::KIND, &scoped, n))
            .find(|candidate| !self.index.contains_key(candidate));
        numbered.unwrap_or(scoped)
    }

    pub fn get(&self, external_id: &str) -> Option<&CapabilityEntry<T>> {
        self.index.get(external_id).map(|&slot| &self.entries[slot])
    }

    /// Look up an entry, failing with `NotFound` for this kind.
    pub fn resolve(&self, external_id: &str) -> Result<&CapabilityEntry<T>, ProxyError> {
        self.get(external_id).ok_or_else(|| ProxyError::NotFound {
            kind: T::KIND,
            id: external_id.to_string(),
        })
    }

    pub fn entries(&self) -> &[CapabilityEntry<T>] {
        &self.entries
    }

    /// Items as presented outward, in table order.
    pub fn items(&self) -> Vec<T> {
        self.entries.iter().map(|e| e.item.clone()).collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.external_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count entries owned by a specific server.
    pub fn count_for_server(&self, server: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.owner.name() == server)
            .count()
    }

    /// Outward view equality: same identifiers, same metadata, same order.
    pub fn same_view(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(&other.entries).all(|(a, b)| {
                a.external_id == b.external_id && a.owner.name() == b.owner.name() && {
                    serde_json::to_value(&a.item).ok() == serde_json::to_value(&b.item).ok()
                }
            })
    }
}

impl RoutingTable<ResourceTemplate> {
    /// Find the template whose literal prefix matches `uri` (longest wins)
    /// and translate `uri` into the owner's namespace.
    pub fn match_uri(&self, uri: &str) -> Option<(&CapabilityEntry<ResourceTemplate>, String)> {
        self.entries
            .iter()
            .filter(|e| template_matches(&e.external_id, uri))
            .max_by_key(|e| naming::literal_prefix(&e.external_id).len())
            .map(|entry| {
                let original_uri = swap_prefix(uri, &entry.external_id, &entry.original_id);
                (entry, original_uri)
            })
    }

    /// Inverse of [`match_uri`](Self::match_uri): the external form of a URI
    /// that `server` knows as `original_uri`.
    pub fn external_uri(&self, server: &str, original_uri: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| e.owner.name() == server && template_matches(&e.original_id, original_uri))
            .max_by_key(|e| naming::literal_prefix(&e.original_id).len())
            .map(|entry| swap_prefix(original_uri, &entry.original_id, &entry.external_id))
    }
}

/// A template matches URIs starting with its (non-empty) literal prefix; a
/// template without variables matches only itself.
fn template_matches(template: &str, uri: &str) -> bool {
    let prefix = naming::literal_prefix(template);
    if prefix.is_empty() {
        return false;
    }
    if prefix.len() == template.len() {
        return uri == template;
    }
    uri.starts_with(prefix)
}

/// Replace `from`'s literal prefix at the start of `uri` with `to`'s.
fn swap_prefix(uri: &str, from: &str, to: &str) -> String {
    let from_prefix = naming::literal_prefix(from);
    format!("{}{}", naming::literal_prefix(to), &uri[from_prefix.len()..])
}

// ─── Tests ───────────────────────────────────────────────────────────────────
