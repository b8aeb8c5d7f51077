//! The registry of authenticated transmitters.
//!
//! Transmitters handshake over the whitelisted control channel and receive a
//! challenge token; every subsequent frame datagram carries that token and
//! nothing else, because a mobile transmitter's source address may change
//! mid-feed (and is trivially spoofed on UDP anyway). The [`Authenticator`]
//! is the sole allocator of client records: both of its indices are updated
//! under one lock, so either a new client is visible through its
//! `(host, identifier)` pair and its token, or through neither.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::token::{ChallengeToken, TokenConfig};

/// Opaque process-unique id of an authenticated transmitter.
///
/// Caches and storage bookkeeping refer to clients by this id rather than by
/// a handle to the record, which keeps the ownership graph acyclic: the
/// authenticator owns clients, the registry owns caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no client matches the presented token")]
    UnknownToken,
    #[error("could not allocate a unique token")]
    TokenExhausted,
}

/// One record per `(host, identifier)` transmitter pair.
#[derive(Debug)]
pub struct AuthenticatedClient {
    id: ClientId,
    host: IpAddr,
    identifier: String,
    token: ChallengeToken,
    created_at: Instant,
    last_frame_at: Mutex<Instant>,
}

impl AuthenticatedClient {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn token(&self) -> &ChallengeToken {
        &self.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Record that a complete frame arrived for this client just now.
    pub fn mark_frame(&self) {
        *self.last_frame_at.lock().unwrap() = Instant::now();
    }

    /// Time since the last complete frame (or since creation, whichever is
    /// later).
    pub fn idle_for(&self) -> Duration {
        self.last_frame_at.lock().unwrap().elapsed()
    }
}

struct Indices {
    by_pair: HashMap<(IpAddr, String), Arc<AuthenticatedClient>>,
    by_token: HashMap<String, Arc<AuthenticatedClient>>,
}

/// Issues and resolves challenge tokens.
pub struct Authenticator {
    token_config: TokenConfig,
    token_ttl: Option<Duration>,
    next_id: AtomicU64,
    indices: Mutex<Indices>,
}

impl Authenticator {
    /// Attempts at a collision-free token before `register` gives up. With
    /// the default eight-digit alphabet this is unreachable in practice.
    const TOKEN_ATTEMPTS: usize = 16;

    pub fn new(token_config: TokenConfig, token_ttl: Option<Duration>) -> Self {
        Self {
            token_config,
            token_ttl,
            next_id: AtomicU64::new(1),
            indices: Mutex::new(Indices {
                by_pair: HashMap::new(),
                by_token: HashMap::new(),
            }),
        }
    }

    /// Return the existing record for `(host, identifier)` or create one.
    ///
    /// Repeated handshakes from the same pair are idempotent and return the
    /// same token, so a transmitter that re-authenticates after a dropout
    /// keeps its identity. Concurrent callers racing on the same pair
    /// observe one canonical record.
    pub fn register(
        &self,
        host: IpAddr,
        identifier: &str,
    ) -> Result<Arc<AuthenticatedClient>, AuthError> {
        let mut indices = self.indices.lock().unwrap();

        let pair = (host, identifier.to_string());
        if let Some(existing) = indices.by_pair.get(&pair) {
            if !self.expired(existing) {
                tracing::debug!(%host, identifier, id = %existing.id, "re-issuing existing token");
                return Ok(existing.clone());
            }
            let stale = existing.clone();
            self.unlink(&mut indices, &stale);
        }

        let token = self.unique_token(&indices)?;
        let now = Instant::now();
        let client = Arc::new(AuthenticatedClient {
            id: ClientId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            host,
            identifier: identifier.to_string(),
            token,
            created_at: now,
            last_frame_at: Mutex::new(now),
        });

        indices.by_pair.insert(pair, client.clone());
        indices
            .by_token
            .insert(client.token.as_str().to_string(), client.clone());

        tracing::debug!(%host, identifier, id = %client.id, "registered new client");
        Ok(client)
    }

    /// Look up the client a frame datagram belongs to.
    pub fn resolve(&self, token: &str) -> Result<Arc<AuthenticatedClient>, AuthError> {
        let mut indices = self.indices.lock().unwrap();

        match indices.by_token.get(token) {
            Some(client) if !self.expired(client) => Ok(client.clone()),
            Some(client) => {
                let stale = client.clone();
                self.unlink(&mut indices, &stale);
                Err(AuthError::UnknownToken)
            }
            None => Err(AuthError::UnknownToken),
        }
    }

    /// Forget a client entirely. Called once its feed has timed out and the
    /// storage flusher has drained its cache.
    pub fn evict(&self, id: ClientId) {
        let mut indices = self.indices.lock().unwrap();
        let Some(client) = indices.by_pair.values().find(|c| c.id == id).cloned() else {
            return;
        };
        self.unlink(&mut indices, &client);
        tracing::debug!(id = %client.id, identifier = client.identifier(), "evicted client");
    }

    /// Snapshot of all live clients, for the storage flusher's sweep.
    pub fn clients(&self) -> Vec<Arc<AuthenticatedClient>> {
        self.indices.lock().unwrap().by_pair.values().cloned().collect()
    }

    fn expired(&self, client: &AuthenticatedClient) -> bool {
        self.token_ttl.is_some_and(|ttl| client.idle_for() > ttl)
    }

    fn unlink(&self, indices: &mut Indices, client: &AuthenticatedClient) {
        indices
            .by_pair
            .remove(&(client.host, client.identifier.clone()));
        indices.by_token.remove(client.token.as_str());
    }

    fn unique_token(&self, indices: &Indices) -> Result<ChallengeToken, AuthError> {
        for _ in 0..Self::TOKEN_ATTEMPTS {
            let token = ChallengeToken::generate(&self.token_config);
            if !indices.by_token.contains_key(token.as_str()) {
                return Ok(token);
            }
        }
        Err(AuthError::TokenExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 101, last])
    }

    fn authenticator() -> Authenticator {
        Authenticator::new(TokenConfig::default(), None)
    }

    #[test]
    fn register_is_idempotent_per_pair() {
        let auth = authenticator();
        let first = auth.register(host(1), "TEST_STREAM").unwrap();
        let second = auth.register(host(1), "TEST_STREAM").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.token(), second.token());
    }

    #[test]
    fn distinct_pairs_get_distinct_tokens() {
        let auth = authenticator();
        let a = auth.register(host(1), "front_cam").unwrap();
        let b = auth.register(host(1), "rear_cam").unwrap();
        let c = auth.register(host(2), "front_cam").unwrap();
        assert_ne!(a.token(), b.token());
        assert_ne!(a.token(), c.token());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn resolve_finds_registered_token() {
        let auth = authenticator();
        let client = auth.register(host(1), "TEST_STREAM").unwrap();
        let resolved = auth.resolve(client.token().as_str()).unwrap();
        assert_eq!(resolved.id(), client.id());
    }

    #[test]
    fn resolve_rejects_unknown_token() {
        let auth = authenticator();
        assert!(matches!(
            auth.resolve("00000000"),
            Err(AuthError::UnknownToken)
        ));
    }

    #[test]
    fn evict_removes_both_indices() {
        let auth = authenticator();
        let client = auth.register(host(1), "TEST_STREAM").unwrap();
        auth.evict(client.id());

        assert!(auth.resolve(client.token().as_str()).is_err());
        // A fresh registration for the pair is a new identity.
        let replacement = auth.register(host(1), "TEST_STREAM").unwrap();
        assert_ne!(replacement.id(), client.id());
    }

    #[test]
    fn idle_clients_expire_when_ttl_is_set() {
        let auth = Authenticator::new(TokenConfig::default(), Some(Duration::from_millis(10)));
        let client = auth.register(host(1), "TEST_STREAM").unwrap();
        let token = client.token().as_str().to_string();

        std::thread::sleep(Duration::from_millis(30));
        assert!(auth.resolve(&token).is_err());

        // Re-registration succeeds and issues a new identity.
        let fresh = auth.register(host(1), "TEST_STREAM").unwrap();
        assert_ne!(fresh.id(), client.id());
    }

    #[test]
    fn frames_keep_a_client_alive() {
        let auth = Authenticator::new(TokenConfig::default(), Some(Duration::from_millis(40)));
        let client = auth.register(host(1), "TEST_STREAM").unwrap();
        let token = client.token().as_str().to_string();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(15));
            client.mark_frame();
        }
        assert!(auth.resolve(&token).is_ok());
    }

    #[test]
    fn token_space_exhaustion_is_an_error() {
        let tiny = TokenConfig {
            alphabet: "ab".to_string(),
            length: 1,
        };
        let auth = Authenticator::new(tiny, None);
        auth.register(host(1), "one").unwrap();
        auth.register(host(1), "two").unwrap();
        assert!(matches!(
            auth.register(host(1), "three"),
            Err(AuthError::TokenExhausted)
        ));
    }
}
