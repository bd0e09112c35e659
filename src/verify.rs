//! Bearer-token verification — signature validation and claim-based
//! authorization.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Resolve the public key through the [`KeyCache`](crate::jwks::KeyCache).
//! 3. Verify the signature plus `exp` / `nbf` (with clock-skew leeway).
//! 4. Check `iss` equals the configured issuer exactly.
//! 5. Check `aud` contains the configured audience (string or array form).
//! 6. Check the required scope is granted via `scp` or `roles`.
//!
//! Checks short-circuit on first failure. The verifier holds no mutable
//! state and runs fully in parallel. No token content is logged.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VerifierConfig;
use crate::jwks::KeyCache;

/// Error variants for token verification failures.
///
/// The variants deliberately carry no claim values; callers render them
/// through [`Error::public_detail`](crate::Error::public_detail), which
/// collapses all of them to one uniform message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// No bearer credential was presented.
    #[error("missing bearer credential")]
    MissingCredential,

    /// The token could not be parsed, or uses an unsupported algorithm.
    #[error("malformed token")]
    Malformed,

    /// Signature verification failed, or no key could be resolved for it.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The token's expiry is in the past, beyond the skew tolerance.
    #[error("token expired")]
    Expired,

    /// The token's not-before is in the future, beyond the skew tolerance.
    #[error("token not yet valid")]
    NotYetValid,

    /// The `iss` claim does not equal the expected issuer.
    #[error("issuer mismatch")]
    IssuerMismatch,

    /// The `aud` claim does not contain the expected audience.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// Neither `scp` nor `roles` grants the required scope.
    #[error("required scope missing")]
    ScopeMissing,
}

/// Verified claims — only ever produced after every check has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenClaims {
    /// `iss` claim.
    pub issuer: String,
    /// `aud` claim, normalized to a list.
    pub audiences: Vec<String>,
    /// `sub` claim.
    pub subject: String,
    /// `oid` claim — the directory object id, when the issuer provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// `exp` claim (Unix timestamp).
    pub expires_at: u64,
    /// `nbf` claim (Unix timestamp).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<u64>,
    /// Scopes from the space-delimited `scp` claim.
    pub scopes: Vec<String>,
    /// Application roles from the `roles` claim.
    pub roles: Vec<String>,
    /// Key id that verified the signature.
    pub key_id: String,
}

/// Raw claims as decoded from the token.
#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    /// May be a single string or an array
    #[serde(default)]
    aud: serde_json::Value,
    exp: u64,
    #[serde(default)]
    nbf: Option<u64>,
    #[serde(default)]
    oid: Option<String>,
    /// Space-delimited delegated scopes
    #[serde(default)]
    scp: Option<String>,
    /// Application roles
    #[serde(default)]
    roles: Option<Vec<String>>,
}

/// Stateless bearer-token verifier.
pub struct TokenVerifier {
    keys: Arc<KeyCache>,
    config: VerifierConfig,
}

impl TokenVerifier {
    /// Create a verifier over `keys` with the expected issuer, audience and
    /// required scope.
    #[must_use]
    pub fn new(keys: Arc<KeyCache>, config: VerifierConfig) -> Self {
        Self { keys, config }
    }

    /// Verify a bearer token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`] on the first failed check, in the order
    /// documented at the module level.
    pub async fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| VerifyError::Malformed)?;
        let alg = allowed_algorithm(header.alg)?;
        let kid = header.kid.ok_or(VerifyError::Malformed)?;

        let key = self.resolve_key(&kid).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = self.config.clock_skew.as_secs();
        validation.validate_nbf = true;
        // Audience and issuer are checked manually below: `aud` may be a
        // string or an array, and failures must map to distinct variants.
        validation.validate_aud = false;

        let token_data: TokenData<RawClaims> =
            jsonwebtoken::decode(token, &key, &validation).map_err(map_decode_error)?;
        let claims = token_data.claims;

        if claims.iss != self.config.issuer {
            debug!(expected = %self.config.issuer, "Token issuer mismatch");
            return Err(VerifyError::IssuerMismatch);
        }

        let audiences = normalize_audiences(&claims.aud);
        if !audiences.iter().any(|a| a == &self.config.audience) {
            debug!(expected = %self.config.audience, "Token audience mismatch");
            return Err(VerifyError::AudienceMismatch);
        }

        let scopes: Vec<String> = claims
            .scp
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let roles = claims.roles.unwrap_or_default();
        let required = &self.config.required_scope;
        if !scopes.iter().any(|s| s == required) && !roles.iter().any(|r| r == required) {
            return Err(VerifyError::ScopeMissing);
        }

        debug!(subject = %claims.sub, kid = %kid, "Token verified");
        Ok(TokenClaims {
            issuer: claims.iss,
            audiences,
            subject: claims.sub,
            object_id: claims.oid,
            expires_at: claims.exp,
            not_before: claims.nbf,
            scopes,
            roles,
            key_id: kid,
        })
    }

    async fn resolve_key(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        self.keys.get_key(kid).await.map_err(|e| {
            debug!(kid = %kid, error = %e, "Signing key resolution failed");
            VerifyError::SignatureInvalid
        })
    }
}

/// Extract the credential from an `Authorization` header value.
///
/// The `Bearer` scheme match is case-insensitive; a missing or foreign
/// scheme yields `None`.
#[must_use]
pub fn extract_bearer(header: &str) -> Option<&str> {
    let (scheme, credential) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then_some(credential)
}

/// Restrict verification to asymmetric algorithms the key set can carry.
fn allowed_algorithm(alg: Algorithm) -> Result<Algorithm, VerifyError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        _ => Err(VerifyError::Malformed),
    }
}

/// Map `jsonwebtoken` failures onto the verification taxonomy.
fn map_decode_error(e: jsonwebtoken::errors::Error) -> VerifyError {
    match e.kind() {
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::ImmatureSignature => VerifyError::NotYetValid,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => VerifyError::Malformed,
        _ => VerifyError::SignatureInvalid,
    }
}

/// Normalize the `aud` claim, which issuers emit as a string or an array.
fn normalize_audiences(aud: &serde_json::Value) -> Vec<String> {
    match aud {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
