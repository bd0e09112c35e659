//! Error types for certgate

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::jwks::KeyError;
use crate::oauth::ExchangeError;
use crate::verify::VerifyError;

/// Result type alias for certgate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error, typed by kind.
///
/// Boundary components surface their own enums ([`KeyError`], [`VerifyError`],
/// [`ExchangeError`]) and convert into this type at the crate surface.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error — fatal at startup, the process must not serve traffic
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network / DNS / TLS failure on an outbound call
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed response or state mismatch — non-retryable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bearer token failed signature or claim checks
    #[error("Token validation failed: {0}")]
    Validation(#[from] VerifyError),

    /// Admission control rejected the request
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateExceeded {
        /// How long the caller should wait before retrying
        retry_after: Duration,
        /// Bucket capacity of the rejecting class, for `X-RateLimit-Limit`
        limit: u32,
    },

    /// Silent renewal is not possible; the user must log in interactively
    #[error("Interactive login required")]
    ReauthRequired,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The string safe to show to an unauthenticated caller.
    ///
    /// Validation and protocol failures collapse to a uniform message so the
    /// response does not reveal which check failed. Rate-limit rejections keep
    /// their retry hint — timing is not sensitive.
    #[must_use]
    pub fn public_detail(&self) -> String {
        match self {
            Self::Validation(_) | Self::Protocol(_) => "invalid token".to_string(),
            Self::RateExceeded { retry_after, .. } => {
                format!("rate limit exceeded, retry after {}s", retry_after.as_secs().max(1))
            }
            Self::ReauthRequired => "authentication required".to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// `true` when the caller may retry the same operation unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateExceeded { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<KeyError> for Error {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Fetch(inner) => Self::Transport(inner.to_string()),
            KeyError::Timeout(d) => Self::Transport(format!("key set refresh timed out after {d:?}")),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ExchangeError> for Error {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::ExchangeFailed(inner) => Self::Transport(inner.to_string()),
            ExchangeError::ReauthRequired => Self::ReauthRequired,
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failures_share_one_public_message() {
        let sig = Error::Validation(VerifyError::SignatureInvalid);
        let aud = Error::Validation(VerifyError::AudienceMismatch);
        let proto = Error::Protocol("state mismatch".to_string());

        assert_eq!(sig.public_detail(), "invalid token");
        assert_eq!(aud.public_detail(), sig.public_detail());
        assert_eq!(proto.public_detail(), "invalid token");
    }

    #[test]
    fn rate_exceeded_reveals_retry_timing() {
        let err = Error::RateExceeded {
            retry_after: Duration::from_secs(3),
            limit: 5,
        };
        assert!(err.public_detail().contains("3s"));
        assert!(err.is_retryable());
    }

    #[test]
    fn transport_is_retryable_protocol_is_not() {
        assert!(Error::Transport("connection reset".to_string()).is_retryable());
        assert!(!Error::Protocol("bad response".to_string()).is_retryable());
    }
}
