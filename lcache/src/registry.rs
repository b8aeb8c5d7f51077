//! Maps authenticated clients and feed identifiers to frame caches.

use std::sync::Arc;

use dashmap::DashMap;
use lbase::{AuthenticatedClient, ClientId};

use crate::feed::{CacheConfig, FrameCache};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no feed matches identifier {0:?}")]
    UnknownIdentifier(String),
}

/// The set of live feeds.
///
/// The registry owns every [`FrameCache`]; clients are referenced by id
/// only. The identifier index exists for viewers, who pick feeds by name,
/// and is kept consistent with the primary map: a feed is reachable by
/// identifier exactly as long as its cache is registered.
pub struct FeedRegistry {
    config: CacheConfig,
    caches: DashMap<ClientId, Arc<FrameCache>>,
    identifiers: DashMap<String, ClientId>,
}

impl FeedRegistry {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            caches: DashMap::new(),
            identifiers: DashMap::new(),
        }
    }

    /// The cache for `client`, created on first use. Creation is atomic per
    /// client: concurrent ingest tasks racing on the first fragments of a
    /// feed end up with the same cache.
    ///
    /// If a second client claims an identifier already in use (same label
    /// from a different host), the identifier index moves to the newer
    /// client; the older feed remains reachable by its client id.
    pub fn get_or_create(&self, client: &AuthenticatedClient) -> Arc<FrameCache> {
        let cache = self
            .caches
            .entry(client.id())
            .or_insert_with(|| {
                tracing::debug!(client = %client.id(), identifier = client.identifier(), "created frame cache");
                Arc::new(FrameCache::new(client.id(), self.config.clone()))
            })
            .clone();
        self.identifiers
            .insert(client.identifier().to_string(), client.id());
        cache
    }

    pub fn get(&self, client_id: ClientId) -> Option<Arc<FrameCache>> {
        self.caches.get(&client_id).map(|cache| Arc::clone(&cache))
    }

    /// The cache a viewer asked for by name.
    pub fn lookup_identifier(&self, identifier: &str) -> Result<Arc<FrameCache>, RegistryError> {
        self.identifiers
            .get(identifier)
            .and_then(|id| self.caches.get(&id).map(|cache| Arc::clone(&cache)))
            .ok_or_else(|| RegistryError::UnknownIdentifier(identifier.to_string()))
    }

    /// Drop a client's cache and, if it still points at this client, the
    /// identifier mapping.
    pub fn remove(&self, client: &AuthenticatedClient) {
        self.caches.remove(&client.id());
        self.identifiers
            .remove_if(client.identifier(), |_, id| *id == client.id());
    }

    /// Identifiers of all registered feeds, sorted for stable display.
    pub fn identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .identifiers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
