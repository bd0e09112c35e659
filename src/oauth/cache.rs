//! Per-session token caching.
//!
//! Tokens live in memory only, scoped to one user session. Nothing here is
//! serializable on purpose: token sets must never reach durable storage or
//! logs. The cache is an explicit value handed to the exchanger so the
//! session layer controls its lifetime and tests can substitute their own.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Buffer subtracted from the expiry so tokens are renewed slightly early.
const EXPIRY_BUFFER_SECS: u64 = 60;

/// An acquired token set and its refresh context.
#[derive(Clone)]
pub struct TokenSet {
    /// Access token presented as the bearer credential.
    pub access_token: String,

    /// Token type (usually "Bearer").
    pub token_type: String,

    /// Refresh context for silent renewal, when the provider granted one.
    pub refresh_token: Option<String>,

    /// Expiry of the access token (Unix timestamp).
    pub expires_at: Option<u64>,

    /// Scopes actually granted.
    pub scope: Option<String>,
}

impl TokenSet {
    /// Build from the token endpoint's response fields.
    #[must_use]
    pub fn from_response(
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        scope: Option<String>,
    ) -> Self {
        let expires_at = expires_in.map(|secs| now_secs() + secs);
        Self {
            access_token,
            token_type: token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token,
            expires_at,
            scope,
        }
    }

    /// Whether the access token should be treated as expired.
    ///
    /// Applies the early-renewal buffer; a token without an expiry never
    /// expires.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_secs() + EXPIRY_BUFFER_SECS >= expires_at,
            None => false,
        }
    }

    /// Time until the access token expires, if it has not already.
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.and_then(|expires_at| {
            let now = now_secs();
            (expires_at > now).then(|| Duration::from_secs(expires_at - now))
        })
    }
}

// Token material must never leak through {:?} formatting.
impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// In-memory token cache for one user session.
///
/// Destroyed with the session or on explicit sign-out.
#[derive(Default)]
pub struct SessionTokenCache {
    entry: RwLock<Option<TokenSet>>,
}

impl SessionTokenCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token set, if any.
    #[must_use]
    pub fn get(&self) -> Option<TokenSet> {
        self.entry.read().clone()
    }

    /// Replace the cached token set.
    pub fn store(&self, tokens: TokenSet) {
        *self.entry.write() = Some(tokens);
    }

    /// Drop the cached token set (sign-out, failed renewal).
    pub fn clear(&self) {
        *self.entry.write() = None;
    }

    /// `true` when a non-expired token set is cached.
    #[must_use]
    pub fn has_valid_token(&self) -> bool {
        self.entry.read().as_ref().is_some_and(|t| !t.is_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiring_in_an_hour_is_not_expired() {
        let token = TokenSet::from_response("tok".to_string(), None, None, Some(3600), None);
        assert!(!token.is_expired());
        assert!(token.time_until_expiry().is_some());
    }

    #[test]
    fn token_within_renewal_buffer_counts_as_expired() {
        // 30s of life left is inside the 60s early-renewal buffer
        let token = TokenSet::from_response("tok".to_string(), None, None, Some(30), None);
        assert!(token.is_expired());
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let token = TokenSet::from_response("tok".to_string(), None, None, None, None);
        assert!(!token.is_expired());
        assert_eq!(token.time_until_expiry(), None);
    }

    #[test]
    fn token_type_defaults_to_bearer() {
        let token = TokenSet::from_response("tok".to_string(), None, None, None, None);
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn debug_output_redacts_token_material() {
        let token = TokenSet::from_response(
            "super-secret-access".to_string(),
            None,
            Some("super-secret-refresh".to_string()),
            Some(3600),
            None,
        );
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("super-secret-access"));
        assert!(!rendered.contains("super-secret-refresh"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn cache_lifecycle_store_get_clear() {
        let cache = SessionTokenCache::new();
        assert!(cache.get().is_none());
        assert!(!cache.has_valid_token());

        cache.store(TokenSet::from_response("tok".to_string(), None, None, Some(3600), None));
        assert!(cache.has_valid_token());
        assert_eq!(cache.get().unwrap().access_token, "tok");

        cache.clear();
        assert!(cache.get().is_none());
    }
}
