//! Configuration management

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest client-assertion lifetime the token endpoint will accept.
pub const MAX_ASSERTION_VALIDITY: Duration = Duration::from_secs(600);

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Bearer-token verification settings (resource-server side)
    pub verifier: VerifierConfig,
    /// Signing-key cache settings
    pub key_cache: KeyCacheConfig,
    /// Token-acquisition settings (client side)
    pub client: ClientConfig,
    /// Rate-limiting settings
    pub rate_limit: RateLimitConfig,
}

/// Bearer-token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Expected `iss` claim, compared exactly
    pub issuer: String,
    /// Expected audience; the token's `aud` claim must contain it
    pub audience: String,
    /// Scope (or role) required for access
    pub required_scope: String,
    /// Tolerated clock skew when checking `exp` / `nbf`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            required_scope: "access_as_user".to_string(),
            clock_skew: Duration::from_secs(60),
        }
    }
}

/// Signing-key cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    /// Key-publication endpoint (JWKS document)
    pub jwks_uri: String,
    /// How long a fetched key set is considered fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long past TTL the last-known-good set may still be served
    /// when a refresh fails
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Upper bound on a single refresh attempt, including retries
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            jwks_uri: String::new(),
            ttl: Duration::from_secs(3600),
            grace_period: Duration::from_secs(300),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

/// Token-acquisition configuration for the client tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// OAuth2 client identifier
    pub client_id: String,
    /// Authorization endpoint the user is sent to
    pub authorize_endpoint: String,
    /// Token endpoint codes and refresh grants are posted to.
    /// Also the audience of every client assertion.
    pub token_endpoint: String,
    /// Redirect URI registered for the authorization-code flow
    pub redirect_uri: String,
    /// PEM file holding the client certificate (may also hold the key)
    pub certificate_path: String,
    /// PEM file holding the private key, when kept separate from the certificate
    pub private_key_path: Option<String>,
    /// Expected SHA-256 certificate thumbprint (hex). When set, a mismatch
    /// with the thumbprint derived from the certificate is fatal.
    pub certificate_thumbprint: Option<String>,
    /// Client-assertion lifetime, capped at 10 minutes
    #[serde(with = "humantime_serde")]
    pub assertion_validity: Duration,
    /// Scopes requested during the code exchange
    pub scopes: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            authorize_endpoint: String::new(),
            token_endpoint: String::new(),
            redirect_uri: "http://localhost:5000/callback".to_string(),
            certificate_path: String::new(),
            private_key_path: None,
            certificate_thumbprint: None,
            assertion_validity: Duration::from_secs(300),
            scopes: Vec::new(),
        }
    }
}

/// Capacity and refill rate for one operation class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassLimit {
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl ClassLimit {
    /// Capacity per minute, the unit operators think in.
    #[must_use]
    pub fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            refill_per_sec: f64::from(capacity) / 60.0,
        }
    }
}

/// Rate-limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable admission control
    pub enabled: bool,
    /// Buckets idle longer than this are garbage-collected
    #[serde(with = "humantime_serde")]
    pub eviction_window: Duration,
    /// Limit for login / callback / token operations
    pub auth: ClassLimit,
    /// Limit for read operations
    pub read: ClassLimit,
    /// Limit for write operations
    pub write: ClassLimit,
    /// Limit for anything unclassified
    pub default: ClassLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            eviction_window: Duration::from_secs(600),
            auth: ClassLimit::per_minute(10),
            read: ClassLimit::per_minute(100),
            write: ClassLimit::per_minute(30),
            default: ClassLimit::per_minute(100),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus `CERTGATE_*`
    /// environment variables, then validate it.
    ///
    /// Env vars use `__` as the section separator, e.g.
    /// `CERTGATE_VERIFIER__ISSUER`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }
        let figment = figment.merge(Env::prefixed("CERTGATE_").split("__"));

        // Two-pass: the env-file list itself comes from the config, and the
        // files it names feed the Env provider on the second extraction.
        let first: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        let config = if first.env_files.is_empty() {
            first
        } else {
            first.load_env_files();
            figment
                .extract()
                .map_err(|e| Error::Config(e.to_string()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configured `.env`-style files into the process environment.
    fn load_env_files(&self) {
        for file in &self.env_files {
            if let Err(e) = dotenvy::from_path(file) {
                tracing::warn!(file = %file, error = %e, "Failed to load env file");
            }
        }
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        require_https("verifier.issuer", &self.verifier.issuer)?;
        if self.verifier.audience.is_empty() {
            return Err(Error::Config("verifier.audience must not be empty".to_string()));
        }
        if self.verifier.required_scope.is_empty() {
            return Err(Error::Config("verifier.required_scope must not be empty".to_string()));
        }
        require_https("key_cache.jwks_uri", &self.key_cache.jwks_uri)?;

        // Client settings are optional (a pure resource server leaves them
        // empty), but once a client_id is present the rest must be coherent.
        if !self.client.client_id.is_empty() {
            require_https("client.authorize_endpoint", &self.client.authorize_endpoint)?;
            require_https("client.token_endpoint", &self.client.token_endpoint)?;
            if !self.client.redirect_uri.starts_with("http://") && !self.client.redirect_uri.starts_with("https://") {
                return Err(Error::Config(
                    "client.redirect_uri must start with http:// or https://".to_string(),
                ));
            }
            let cert = Path::new(&self.client.certificate_path);
            if !cert.is_file() {
                return Err(Error::Config(format!(
                    "certificate file not found: {}",
                    self.client.certificate_path
                )));
            }
            if let Some(key) = &self.client.private_key_path {
                if !Path::new(key).is_file() {
                    return Err(Error::Config(format!("private key file not found: {key}")));
                }
            }
            if self.client.assertion_validity > MAX_ASSERTION_VALIDITY {
                return Err(Error::Config(format!(
                    "client.assertion_validity must be at most {}s",
                    MAX_ASSERTION_VALIDITY.as_secs()
                )));
            }
            if self.client.assertion_validity.is_zero() {
                return Err(Error::Config("client.assertion_validity must be positive".to_string()));
            }
        }

        for (name, limit) in [
            ("auth", self.rate_limit.auth),
            ("read", self.rate_limit.read),
            ("write", self.rate_limit.write),
            ("default", self.rate_limit.default),
        ] {
            if limit.capacity == 0 {
                return Err(Error::Config(format!("rate_limit.{name}.capacity must be at least 1")));
            }
            if limit.refill_per_sec <= 0.0 {
                return Err(Error::Config(format!("rate_limit.{name}.refill_per_sec must be positive")));
            }
        }

        Ok(())
    }
}

/// Endpoints must be HTTPS; plain HTTP is tolerated for localhost only
/// (development and tests).
fn require_https(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("{field} must not be empty")));
    }
    if value.starts_with("https://") {
        return Ok(());
    }
    if value.starts_with("http://localhost") || value.starts_with("http://127.0.0.1") {
        return Ok(());
    }
    Err(Error::Config(format!("{field} must use https (got '{value}')")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            verifier: VerifierConfig {
                issuer: "https://login.example.com/tenant-x/v2.0".to_string(),
                audience: "api://resource-1".to_string(),
                ..VerifierConfig::default()
            },
            key_cache: KeyCacheConfig {
                jwks_uri: "https://login.example.com/tenant-x/discovery/v2.0/keys".to_string(),
                ..KeyCacheConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn plain_http_issuer_is_rejected() {
        let mut config = valid_config();
        config.verifier.issuer = "http://login.example.com/tenant-x/v2.0".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn localhost_http_is_allowed_for_development() {
        let mut config = valid_config();
        config.key_cache.jwks_uri = "http://127.0.0.1:9000/keys".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_audience_is_rejected() {
        let mut config = valid_config();
        config.verifier.audience = String::new();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn client_section_requires_existing_certificate() {
        let mut config = valid_config();
        config.client.client_id = "11111111-2222-3333-4444-555555555555".to_string();
        config.client.authorize_endpoint = "https://login.example.com/authorize".to_string();
        config.client.token_endpoint = "https://login.example.com/token".to_string();
        config.client.certificate_path = "/nonexistent/cert.pem".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn assertion_validity_above_ten_minutes_is_rejected() {
        let cert = tempfile::NamedTempFile::new().unwrap();
        let mut config = valid_config();
        config.client.client_id = "client".to_string();
        config.client.authorize_endpoint = "https://login.example.com/authorize".to_string();
        config.client.token_endpoint = "https://login.example.com/token".to_string();
        config.client.certificate_path = cert.path().display().to_string();
        config.client.assertion_validity = Duration::from_secs(601);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_capacity_class_is_rejected() {
        let mut config = valid_config();
        config.rate_limit.read.capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn class_limit_per_minute_refill_matches_capacity() {
        let limit = ClassLimit::per_minute(30);
        assert_eq!(limit.capacity, 30);
        assert!((limit.refill_per_sec - 0.5).abs() < f64::EPSILON);
    }
}
