//! Inbound request guard: admission control plus bearer-token verification.
//!
//! Every protected operation passes through [`RequestGate::check`] before any
//! business logic runs. Admission is keyed by the verified subject once
//! authentication succeeds; unauthenticated probes are charged against the
//! connection-level identity instead, so a burst of junk tokens cannot bypass
//! the limiter by failing verification.

use std::sync::Arc;

use crate::ratelimit::{OperationClass, RateDecision, RateLimiter};
use crate::verify::{TokenClaims, TokenVerifier, VerifyError, extract_bearer};
use crate::{Error, Result};

/// Combined guard for the inbound API boundary.
pub struct RequestGate {
    verifier: Arc<TokenVerifier>,
    limiter: Arc<RateLimiter>,
}

impl RequestGate {
    /// Create a gate over the shared verifier and limiter.
    #[must_use]
    pub fn new(verifier: Arc<TokenVerifier>, limiter: Arc<RateLimiter>) -> Self {
        Self { verifier, limiter }
    }

    /// Verify the `Authorization` header value and admit the request.
    ///
    /// On success returns the verified claims plus the admission decision
    /// (for `X-RateLimit-*` response headers). On failure the error's
    /// [`public_detail`](Error::public_detail) is what the caller should
    /// surface; it never reveals which check failed.
    ///
    /// # Errors
    ///
    /// [`Error::RateExceeded`] when admission fails (for either identity
    /// key); [`Error::Validation`] for missing or invalid credentials.
    pub async fn check(
        &self,
        authorization: Option<&str>,
        connection_identity: &str,
        class: OperationClass,
    ) -> Result<(TokenClaims, RateDecision)> {
        let verified = match authorization.and_then(extract_bearer) {
            Some(token) => self.verifier.verify(token).await,
            None => Err(VerifyError::MissingCredential),
        };

        match verified {
            Ok(claims) => {
                let decision = self.limiter.try_admit(&claims.subject, class, 1.0)?;
                Ok((claims, decision))
            }
            Err(e) => {
                // Probes count against the connection identity. A limiter
                // rejection takes precedence in the response: it only
                // reveals retry timing, which is not sensitive.
                self.limiter.try_admit(connection_identity, class, 1.0)?;
                Err(Error::Validation(e))
            }
        }
    }
}
