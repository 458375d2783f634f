//! Reference-counted resource subscriptions.
//!
//! Outward clients subscribe by external URI; the downstream only ever sees
//! one subscription per `(server, original_uri)`, held while at least one
//! client wants it. External URIs are not stored: they are derived from the
//! current catalog whenever an update goes out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::downstream::ProxyError;

/// Result of the single downstream `resources/subscribe` for one key, shared
/// by every client that joins while it is in flight.
pub type SubscribeOutcome = Arc<OnceCell<Result<(), ProxyError>>>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    server: String,
    original_uri: String,
}

#[derive(Debug, Clone)]
struct Subscription {
    clients: BTreeSet<Uuid>,
    outcome: SubscribeOutcome,
}

/// A downstream subscription that no client wants any more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub server: String,
    pub original_uri: String,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<Key, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `client`'s interest and return the key's downstream outcome.
    ///
    /// The first caller to initialize the outcome performs the downstream
    /// subscribe; later callers wait on the same cell.
    pub fn add(&mut self, server: &str, original_uri: &str, client: Uuid) -> SubscribeOutcome {
        let key = Key {
            server: server.to_string(),
            original_uri: original_uri.to_string(),
        };
        let entry = self.entries.entry(key).or_insert_with(|| Subscription {
            clients: BTreeSet::new(),
            outcome: Arc::new(OnceCell::new()),
        });
        entry.clients.insert(client);
        Arc::clone(&entry.outcome)
    }

    /// Drop `client`'s interest. Returns `true` when it was the last
    /// subscriber, i.e. the downstream should be unsubscribed.
    pub fn remove(&mut self, server: &str, original_uri: &str, client: Uuid) -> bool {
        let key = Key {
            server: server.to_string(),
            original_uri: original_uri.to_string(),
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if !entry.clients.remove(&client) {
            return false;
        }
        if entry.clients.is_empty() {
            self.entries.remove(&key);
            return true;
        }
        false
    }

    /// Forget every subscription of a departing client.
    pub fn remove_client(&mut self, client: Uuid) -> Vec<Released> {
        let mut released = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.clients.remove(&client) && entry.clients.is_empty() {
                released.push(Released {
                    server: key.server.clone(),
                    original_uri: key.original_uri.clone(),
                });
                return false;
            }
            true
        });
        released
    }

    /// Forget every subscription held on a removed server.
    pub fn remove_server(&mut self, server: &str) {
        self.entries.retain(|key, _| key.server != server);
    }

    /// Subscribers for an update reported by `server`.
    pub fn lookup(&self, server: &str, original_uri: &str) -> Option<Vec<Uuid>> {
        let key = Key {
            server: server.to_string(),
            original_uri: original_uri.to_string(),
        };
        self.entries
            .get(&key)
            .map(|entry| entry.clients.iter().copied().collect())
    }

    /// Original URIs currently subscribed on `server`.
    pub fn uris_for_server(&self, server: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|key| key.server == server)
            .map(|key| key.original_uri.clone())
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
