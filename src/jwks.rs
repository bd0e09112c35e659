//! Remote signing-key discovery and caching.
//!
//! # Refresh flow
//!
//! 1. Verification asks [`KeyCache::get_key`] for the key matching a token's
//!    `kid`.
//! 2. A fresh cached set answers directly; a stale or missing set triggers a
//!    refresh through [`KeySource`].
//! 3. Concurrent misses — for *any* key id — collapse into one outstanding
//!    fetch; every waiter shares its result.
//! 4. A failed refresh serves the last-known-good set for a bounded grace
//!    period, then fails closed.
//!
//! An unknown `kid` in a fresh set triggers a single forced refresh before
//! failing; prevents indefinite re-fetching if the key truly does not exist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::KeyCacheConfig;

/// Error variants for key discovery and caching.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Network or HTTP error while fetching the key set.
    #[error("key set fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The key-publication endpoint returned a document we refuse to use.
    #[error("malformed key set: {0}")]
    Parse(String),

    /// No key with this id exists, even after a forced refresh.
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    /// Refresh failed and no last-known-good set was within its grace period.
    #[error("key set refresh failed: {0}")]
    RefreshFailed(String),

    /// The refresh did not complete within its timeout.
    #[error("key set refresh timed out after {0:?}")]
    Timeout(Duration),
}

/// Fetches the remote key set. One implementation per transport; tests
/// substitute fakes.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch and parse the key set. No internal retries — retry policy
    /// belongs to [`KeyCache`].
    async fn fetch(&self) -> Result<SigningKeySet, KeyError>;
}

/// Parsed, immutable set of public signing keys.
///
/// Replaced wholesale on refresh, never mutated in place.
#[derive(Debug, Clone)]
pub struct SigningKeySet {
    keys: JwkSet,
}

impl SigningKeySet {
    /// Build from a parsed JWKS document, failing closed on entries without a
    /// key id or with a duplicate key id.
    pub fn from_jwk_set(keys: JwkSet) -> Result<Self, KeyError> {
        let mut seen: Vec<&str> = Vec::with_capacity(keys.keys.len());
        for jwk in &keys.keys {
            let kid = jwk
                .common
                .key_id
                .as_deref()
                .ok_or_else(|| KeyError::Parse("key entry missing 'kid'".to_string()))?;
            if seen.contains(&kid) {
                return Err(KeyError::Parse(format!("duplicate key id '{kid}'")));
            }
            seen.push(kid);
        }
        Ok(Self { keys })
    }

    /// Convert the key with this id into a [`DecodingKey`], if present and of
    /// a supported type (RSA or EC).
    #[must_use]
    pub fn decoding_key(&self, kid: &str) -> Option<DecodingKey> {
        let jwk = self
            .keys
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))?;

        match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        }
    }

    /// Key ids in publication order.
    #[must_use]
    pub fn key_ids(&self) -> Vec<&str> {
        self.keys
            .keys
            .iter()
            .filter_map(|k| k.common.key_id.as_deref())
            .collect()
    }

    /// Number of keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.keys.len()
    }

    /// `true` when the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.keys.is_empty()
    }
}

/// HTTPS key source for the well-known key-publication endpoint.
pub struct HttpKeySource {
    http: reqwest::Client,
    jwks_uri: String,
}

impl HttpKeySource {
    /// Build a source for the configured endpoint.
    ///
    /// HTTPS is enforced unless the endpoint is explicitly `http://` (config
    /// validation restricts that to localhost).
    pub fn new(config: &KeyCacheConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(!config.jwks_uri.starts_with("http://"))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            jwks_uri: config.jwks_uri.clone(),
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<SigningKeySet, KeyError> {
        debug!(uri = %self.jwks_uri, "Fetching signing key set");
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?;

        let keys: JwkSet = response.json().await.map_err(|e| {
            if e.is_decode() {
                KeyError::Parse(e.to_string())
            } else {
                KeyError::Fetch(e)
            }
        })?;

        SigningKeySet::from_jwk_set(keys)
    }
}

/// A key set plus the instant it was fetched.
struct CachedKeySet {
    set: Arc<SigningKeySet>,
    fetched_at: Instant,
}

impl CachedKeySet {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }

    fn within_grace(&self, ttl: Duration, grace: Duration) -> bool {
        self.fetched_at.elapsed() < ttl + grace
    }
}

/// TTL cache over a [`KeySource`], shielding it from per-request calls.
///
/// Reads go through a `RwLock` and run in parallel; the refresh gate is the
/// one coordination point broader than per-key locking — every concurrent
/// miss waits on the same fetch.
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    ttl: Duration,
    grace: Duration,
    refresh_timeout: Duration,
    current: RwLock<Option<CachedKeySet>>,
    refresh_gate: Mutex<()>,
}

impl KeyCache {
    /// Create a cache over `source` with the configured TTL, grace period and
    /// refresh timeout.
    #[must_use]
    pub fn new(source: Arc<dyn KeySource>, config: &KeyCacheConfig) -> Self {
        Self {
            source,
            ttl: config.ttl,
            grace: config.grace_period,
            refresh_timeout: config.refresh_timeout,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Resolve a public key by id, refreshing the set as needed.
    ///
    /// # Errors
    ///
    /// [`KeyError::UnknownKeyId`] when the id is absent even after a refresh;
    /// [`KeyError::RefreshFailed`] / [`KeyError::Timeout`] when the set could
    /// not be refreshed and no last-known-good set is within its grace period.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, KeyError> {
        // Fast path: fresh set, known key.
        let (observed, force) = {
            let cur = self.current.read().await;
            match &*cur {
                Some(c) if c.is_fresh(self.ttl) => {
                    if let Some(key) = c.set.decoding_key(kid) {
                        return Ok(key);
                    }
                    debug!(kid = %kid, "Key not in fresh set, forcing refresh");
                    (Some(c.fetched_at), true)
                }
                Some(c) => (Some(c.fetched_at), false),
                None => (None, false),
            }
        };

        let set = self.refresh(observed, force).await?;
        set.decoding_key(kid)
            .ok_or_else(|| KeyError::UnknownKeyId(kid.to_string()))
    }

    /// Replace the cached set via the source, collapsing concurrent callers
    /// into a single fetch.
    ///
    /// `observed` is the `fetched_at` of the set the caller saw (if any); when
    /// another waiter has refreshed in the meantime the new set is returned
    /// without fetching again. `force` bypasses the freshness re-check, for
    /// unknown-kid refreshes of a still-fresh set.
    async fn refresh(
        &self,
        observed: Option<Instant>,
        force: bool,
    ) -> Result<Arc<SigningKeySet>, KeyError> {
        let _gate = self.refresh_gate.lock().await;

        {
            let cur = self.current.read().await;
            if let Some(c) = &*cur {
                let refreshed_since = observed != Some(c.fetched_at);
                if refreshed_since || (!force && c.is_fresh(self.ttl)) {
                    return Ok(Arc::clone(&c.set));
                }
            }
        }

        let fetch = || self.source.fetch();
        let attempt = tokio::time::timeout(
            self.refresh_timeout,
            fetch
                .retry(ExponentialBuilder::default().with_max_times(2))
                .when(|e: &KeyError| matches!(e, KeyError::Fetch(_)))
                .notify(|e, after| warn!(error = %e, retry_in = ?after, "Key set fetch failed, retrying")),
        )
        .await;

        let outcome = match attempt {
            Ok(Ok(set)) => Ok(set),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(KeyError::Timeout(self.refresh_timeout)),
        };

        match outcome {
            Ok(set) => {
                debug!(keys = set.len(), "Signing key set refreshed");
                let set = Arc::new(set);
                *self.current.write().await = Some(CachedKeySet {
                    set: Arc::clone(&set),
                    fetched_at: Instant::now(),
                });
                Ok(set)
            }
            Err(e) => {
                let cur = self.current.read().await;
                if let Some(c) = &*cur {
                    if c.within_grace(self.ttl, self.grace) {
                        warn!(error = %e, "Key set refresh failed, serving last-known-good set");
                        return Ok(Arc::clone(&c.set));
                    }
                }
                match e {
                    KeyError::Timeout(d) => Err(KeyError::Timeout(d)),
                    other => Err(KeyError::RefreshFailed(other.to_string())),
                }
            }
        }
    }
}
