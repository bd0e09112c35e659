//! certgate — certificate-bound token auth core
//!
//! The authentication-and-authorization core shared by the client and API
//! tiers of a certificate-secured, token-based system.
//!
//! # Features
//!
//! - **Token acquisition**: OAuth2 authorization-code exchange authenticated
//!   with an X.509-bound signed client assertion, with in-memory
//!   silent-renewal caching per session
//! - **Token verification**: bearer-token signature and claim checks against
//!   a TTL-cached remote signing-key set (single-flight refresh,
//!   last-known-good grace period)
//! - **Admission control**: per-identity token-bucket rate limiting with
//!   operation classes and a retry-after hint
//!
//! # Flow
//!
//! Resource side: request → [`gate::RequestGate`] → [`verify::TokenVerifier`]
//! (consulting [`jwks::KeyCache`]) → verified [`verify::TokenClaims`].
//! Client side: interactive login → [`oauth::CodeExchanger`] (signing with
//! [`assertion::CredentialSigner`]) → cached token set → silent reuse.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assertion;
pub mod config;
pub mod error;
pub mod gate;
pub mod jwks;
pub mod oauth;
pub mod ratelimit;
pub mod verify;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
