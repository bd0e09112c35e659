//! Authorization-code exchange state machine.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use rand::RngExt;
use reqwest::Client;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use super::cache::{SessionTokenCache, TokenSet};
use crate::assertion::CredentialSigner;
use crate::config::ClientConfig;

/// `client_assertion_type` value for JWT-based client authentication.
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Error variants for the authorization-code exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The callback's state value does not match the one issued at login.
    /// Possible CSRF; forces re-authentication.
    #[error("anti-forgery state mismatch")]
    StateMismatch,

    /// A callback arrived with no login in progress.
    #[error("no login in progress")]
    NoPendingLogin,

    /// Network failure talking to the token endpoint. Retryable by the caller.
    #[error("token exchange failed: {0}")]
    ExchangeFailed(#[source] reqwest::Error),

    /// The token endpoint rejected the request. Non-retryable.
    #[error("token endpoint rejected the request: {0}")]
    Rejected(String),

    /// The token endpoint answered with a body we could not parse.
    #[error("malformed token endpoint response: {0}")]
    MalformedResponse(String),

    /// The client assertion could not be signed. Non-retryable.
    #[error("client assertion signing failed")]
    AssertionFailed,

    /// An endpoint URL from configuration did not parse.
    #[error("invalid endpoint configuration: {0}")]
    BadEndpoint(String),

    /// Silent renewal is not possible; interactive login is required.
    #[error("interactive login required")]
    ReauthRequired,
}

/// Where a session currently sits in the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No tokens and no login in progress.
    Unauthenticated,
    /// Login initiated; waiting for the provider callback.
    AwaitingCallback,
    /// A usable access token is cached.
    Authenticated,
    /// The cached token has expired but a refresh context remains.
    Expired,
}

/// What the caller needs to send the user to the authorization endpoint.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    /// Fully formed authorization URL, including the anti-forgery state.
    pub authorize_url: String,
    /// The state value, should the session layer want to double-submit it.
    pub state: String,
}

struct PendingLogin {
    state: String,
}

/// Token endpoint success response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// Token endpoint error response (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Drives the authorization-code-for-token exchange and silent renewal for
/// one user session.
///
/// State machine: `Unauthenticated → AwaitingCallback → Authenticated →
/// (Expired → Authenticated | Unauthenticated)`. Callbacks without a pending
/// login and mismatched anti-forgery state are rejected before any network
/// call is made.
pub struct CodeExchanger {
    http: Client,
    config: ClientConfig,
    signer: Arc<CredentialSigner>,
    cache: Arc<SessionTokenCache>,
    pending: Mutex<Option<PendingLogin>>,
}

impl CodeExchanger {
    /// Create an exchanger for one session.
    ///
    /// `cache` is the session's token cache; dropping or clearing it ends
    /// the authenticated state.
    #[must_use]
    pub fn new(
        http: Client,
        config: ClientConfig,
        signer: Arc<CredentialSigner>,
        cache: Arc<SessionTokenCache>,
    ) -> Self {
        Self {
            http,
            config,
            signer,
            cache,
            pending: Mutex::new(None),
        }
    }

    /// Initiate login: mint an anti-forgery state value, persist it for the
    /// callback, and build the authorization URL.
    ///
    /// Calling this again abandons any earlier pending login.
    pub fn begin_login(&self) -> Result<LoginRequest, ExchangeError> {
        let state = generate_state();

        let mut auth_url = Url::parse(&self.config.authorize_endpoint)
            .map_err(|e| ExchangeError::BadEndpoint(e.to_string()))?;
        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.config.redirect_uri);
            params.append_pair("state", &state);
            if !self.config.scopes.is_empty() {
                params.append_pair("scope", &self.config.scopes.join(" "));
            }
        }

        *self.pending.lock() = Some(PendingLogin {
            state: state.clone(),
        });

        info!("Login initiated, awaiting authorization callback");
        Ok(LoginRequest {
            authorize_url: auth_url.to_string(),
            state,
        })
    }

    /// Handle the provider callback: verify the returned state, exchange the
    /// authorization code, and cache the resulting token set.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::StateMismatch`] and [`ExchangeError::NoPendingLogin`]
    /// reject the callback before any token-endpoint call.
    /// [`ExchangeError::ExchangeFailed`] (network) keeps the pending login so
    /// the caller may retry; every other failure forces re-authentication.
    pub async fn complete_login(
        &self,
        code: &str,
        returned_state: &str,
    ) -> Result<(), ExchangeError> {
        let state_matches = match self.pending.lock().as_ref() {
            None => return Err(ExchangeError::NoPendingLogin),
            Some(p) => states_match(&p.state, returned_state),
        };
        if !state_matches {
            warn!("Authorization callback carried a mismatched state value");
            *self.pending.lock() = None;
            return Err(ExchangeError::StateMismatch);
        }

        match self.exchange_code(code).await {
            Ok(tokens) => {
                *self.pending.lock() = None;
                self.cache.store(tokens);
                info!("Authorization code exchanged, session authenticated");
                Ok(())
            }
            // Transport failures are retryable with the same code; keep the
            // pending login alive.
            Err(e @ ExchangeError::ExchangeFailed(_)) => Err(e),
            Err(e) => {
                *self.pending.lock() = None;
                Err(e)
            }
        }
    }

    /// Return a valid access token, renewing silently when possible.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::ReauthRequired`] when no cached token set exists or
    /// the provider rejected the refresh grant — the caller must start an
    /// interactive login. Transport failures during renewal surface as
    /// [`ExchangeError::ExchangeFailed`] and leave the cache untouched.
    pub async fn access_token(&self) -> Result<String, ExchangeError> {
        let Some(tokens) = self.cache.get() else {
            return Err(ExchangeError::ReauthRequired);
        };
        if !tokens.is_expired() {
            return Ok(tokens.access_token);
        }

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            self.cache.clear();
            return Err(ExchangeError::ReauthRequired);
        };

        debug!("Access token expired, attempting silent renewal");
        match self.refresh(&refresh_token).await {
            Ok(mut renewed) => {
                // Providers may omit the refresh token on renewal; keep the
                // existing context in that case.
                if renewed.refresh_token.is_none() {
                    renewed.refresh_token = Some(refresh_token);
                }
                let access = renewed.access_token.clone();
                self.cache.store(renewed);
                info!("Access token renewed silently");
                Ok(access)
            }
            Err(e @ ExchangeError::ExchangeFailed(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Silent renewal rejected, interactive login required");
                self.cache.clear();
                Err(ExchangeError::ReauthRequired)
            }
        }
    }

    /// Destroy the session's tokens and any pending login.
    pub fn sign_out(&self) {
        *self.pending.lock() = None;
        self.cache.clear();
        info!("Session signed out");
    }

    /// Current phase of the login state machine.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if let Some(tokens) = self.cache.get() {
            if !tokens.is_expired() {
                return SessionPhase::Authenticated;
            }
            if tokens.refresh_token.is_some() {
                return SessionPhase::Expired;
            }
        }
        if self.pending.lock().is_some() {
            return SessionPhase::AwaitingCallback;
        }
        SessionPhase::Unauthenticated
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ExchangeError> {
        let assertion = self
            .signer
            .sign(&self.config.token_endpoint)
            .map_err(|_| ExchangeError::AssertionFailed)?;
        let scope = self.config.scopes.join(" ");

        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", self.config.redirect_uri.as_str());
        params.insert("client_id", self.config.client_id.as_str());
        if !scope.is_empty() {
            params.insert("scope", scope.as_str());
        }
        params.insert("client_assertion_type", CLIENT_ASSERTION_TYPE);
        params.insert("client_assertion", assertion.jwt.as_str());

        self.post_token_request(&params).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ExchangeError> {
        let assertion = self
            .signer
            .sign(&self.config.token_endpoint)
            .map_err(|_| ExchangeError::AssertionFailed)?;
        let scope = self.config.scopes.join(" ");

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", self.config.client_id.as_str());
        if !scope.is_empty() {
            params.insert("scope", scope.as_str());
        }
        params.insert("client_assertion_type", CLIENT_ASSERTION_TYPE);
        params.insert("client_assertion", assertion.jwt.as_str());

        self.post_token_request(&params).await
    }

    async fn post_token_request(
        &self,
        params: &HashMap<&str, &str>,
    ) -> Result<TokenSet, ExchangeError> {
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(ExchangeError::ExchangeFailed)?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<TokenErrorResponse>().await {
                Ok(body) => match body.error_description {
                    Some(desc) => format!("{} ({desc})", body.error),
                    None => body.error,
                },
                Err(_) => format!("HTTP {status}"),
            };
            return Err(ExchangeError::Rejected(detail));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        Ok(TokenSet::from_response(
            body.access_token,
            body.token_type,
            body.refresh_token,
            body.expires_in,
            body.scope,
        ))
    }
}

/// Generate a random anti-forgery state parameter.
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Constant-time state comparison. Length is not secret.
fn states_match(expected: &str, returned: &str) -> bool {
    expected.len() == returned.len()
        && expected.as_bytes().ct_eq(returned.as_bytes()).into()
}
