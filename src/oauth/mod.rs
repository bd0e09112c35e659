//! OAuth 2.0 authorization-code exchange with certificate-bound client
//! authentication.
//!
//! Implements the delegated-token acquisition side of the system:
//! - Authorization-code flow driven as an explicit state machine
//!   (`Unauthenticated → AwaitingCallback → Authenticated`)
//! - Anti-forgery state generation and constant-time callback verification
//! - Code and refresh-grant exchange authenticated with a signed client
//!   assertion instead of a shared secret
//! - In-memory, per-session token caching with silent renewal

mod cache;
mod exchanger;

pub use cache::{SessionTokenCache, TokenSet};
pub use exchanger::{CodeExchanger, ExchangeError, LoginRequest, SessionPhase};
