//! Capability aggregator: merges downstream catalogs into routing tables.
//!
//! A [`Catalog`] is an immutable snapshot of the four routing tables. It is
//! built off to the side from the connected servers and published by the
//! proxy with a single pointer swap, so readers never see a half-built table.

pub mod naming;
pub mod table;

use std::sync::Arc;

use crate::downstream::{
    Capability, CapabilityKind, DownstreamConnection, Prompt, ProxyError, Resource,
    ResourceTemplate, Tool,
};

pub use table::{CapabilityEntry, RoutingTable};

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Everything one connection reported, fetched before assembly.
struct Listing {
    owner: Arc<DownstreamConnection>,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
    templates: Vec<ResourceTemplate>,
}

/// The merged, routable view of every connected downstream server.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tools: RoutingTable<Tool>,
    pub resources: RoutingTable<Resource>,
    pub prompts: RoutingTable<Prompt>,
    pub templates: RoutingTable<ResourceTemplate>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a catalog from `connections`, in the order given.
    ///
    /// Connections that are not `Connected` contribute nothing. Listing runs
    /// concurrently across connections; assembly happens afterwards in supply
    /// order so identical inputs always produce identical identifiers. A kind
    /// that fails to list is logged and treated as empty for that server.
    pub async fn build(connections: &[Arc<DownstreamConnection>]) -> Self {
        let live: Vec<_> = connections
            .iter()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();

        let listings = futures::future::join_all(live.into_iter().map(fetch)).await;

        let mut catalog = Self::empty();
        for listing in listings {
            for item in listing.tools {
                catalog.tools.insert(&listing.owner, item);
            }
            for item in listing.resources {
                catalog.resources.insert(&listing.owner, item);
            }
            for item in listing.prompts {
                catalog.prompts.insert(&listing.owner, item);
            }
            for item in listing.templates {
                catalog.templates.insert(&listing.owner, item);
            }
        }

        tracing::info!(
            tools = catalog.tools.len(),
            resources = catalog.resources.len(),
            prompts = catalog.prompts.len(),
            templates = catalog.templates.len(),
            "catalog built"
        );
        catalog
    }

    /// Kinds whose outward view differs between `self` and `previous`.
    pub fn changed_kinds(&self, previous: &Self) -> Vec<CapabilityKind> {
        let mut changed = Vec::new();
        if !self.tools.same_view(&previous.tools) {
            changed.push(CapabilityKind::Tool);
        }
        if !self.resources.same_view(&previous.resources) {
            changed.push(CapabilityKind::Resource);
        }
        if !self.prompts.same_view(&previous.prompts) {
            changed.push(CapabilityKind::Prompt);
        }
        if !self.templates.same_view(&previous.templates) {
            changed.push(CapabilityKind::ResourceTemplate);
        }
        changed
    }

    /// Resolve an external resource URI to its owner and downstream URI.
    ///
    /// Exact resources win over template matches.
    pub fn resolve_resource(
        &self,
        uri: &str,
    ) -> Result<(Arc<DownstreamConnection>, String), ProxyError> {
        if let Some(entry) = self.resources.get(uri) {
            return Ok((Arc::clone(&entry.owner), entry.original_id.clone()));
        }
        self.templates
            .match_uri(uri)
            .map(|(entry, original)| (Arc::clone(&entry.owner), original))
            .ok_or_else(|| ProxyError::NotFound {
                kind: CapabilityKind::Resource,
                id: uri.to_string(),
            })
    }

    /// Current external URI for a resource `server` knows as `original_uri`.
    ///
    /// Exact resources win over template matches, mirroring
    /// [`resolve_resource`](Self::resolve_resource).
    pub fn external_resource_uri(&self, server: &str, original_uri: &str) -> Option<String> {
        self.resources
            .entries()
            .iter()
            .find(|e| e.owner.name() == server && e.original_id == original_uri)
            .map(|e| e.external_id.clone())
            .or_else(|| self.templates.external_uri(server, original_uri))
    }

    /// Number of capabilities of every kind owned by `server`.
    pub fn count_for_server(&self, server: &str) -> usize {
        self.tools.count_for_server(server)
            + self.resources.count_for_server(server)
            + self.prompts.count_for_server(server)
            + self.templates.count_for_server(server)
    }
}

async fn fetch(owner: Arc<DownstreamConnection>) -> Listing {
    let (tools, resources, prompts, templates) = tokio::join!(
        list_or_empty::<Tool>(&owner),
        list_or_empty::<Resource>(&owner),
        list_or_empty::<Prompt>(&owner),
        list_or_empty::<ResourceTemplate>(&owner),
    );
    Listing {
        owner,
        tools,
        resources,
        prompts,
        templates,
    }
}

async fn list_or_empty<T: Capability>(conn: &DownstreamConnection) -> Vec<T> {
    match conn.list::<T>().await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(
                server = %conn.name(),
                kind = %T::KIND,
                error = %e,
                "listing failed, server contributes none of this kind"
            );
            Vec::new()
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
