//! Shared test fixtures: an in-test identity provider that mints ES256
//! tokens and publishes the matching JWKS document.

#![allow(dead_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;

pub const ISSUER: &str = "https://login.example.com/tenant-x/v2.0";
pub const AUDIENCE: &str = "api://resource-1";
pub const REQUIRED_SCOPE: &str = "access_as_user";

/// A signing identity: one ES256 key pair plus its published key id.
pub struct TestIdp {
    key_pair: rcgen::KeyPair,
    pub kid: String,
}

impl TestIdp {
    pub fn new(kid: &str) -> Self {
        Self {
            key_pair: rcgen::KeyPair::generate().unwrap(),
            kid: kid.to_string(),
        }
    }

    /// The JWKS document this provider would publish.
    pub fn jwks_document(&self) -> serde_json::Value {
        let (x, y) = self.public_coordinates();
        json!({
            "keys": [{
                "kty": "EC",
                "crv": "P-256",
                "use": "sig",
                "alg": "ES256",
                "kid": self.kid,
                "x": x,
                "y": y,
            }]
        })
    }

    /// Mint a token signed by this provider under its published key id.
    pub fn mint(&self, claims: &serde_json::Value) -> String {
        self.mint_with_kid(&self.kid, claims)
    }

    /// Mint a token claiming an arbitrary key id (e.g. one the JWKS does not
    /// carry).
    pub fn mint_with_kid(&self, kid: &str, claims: &serde_json::Value) -> String {
        let key = EncodingKey::from_ec_pem(self.key_pair.serialize_pem().as_bytes()).unwrap();
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }

    /// P-256 coordinates of the public key, base64url-encoded for the JWKS.
    fn public_coordinates(&self) -> (String, String) {
        let raw = self.key_pair.public_key_raw();
        // Uncompressed SEC1 point: 0x04 || X || Y
        let point = match raw.len() {
            65 => &raw[1..],
            64 => raw,
            n => panic!("unexpected public key length {n}"),
        };
        (
            URL_SAFE_NO_PAD.encode(&point[..32]),
            URL_SAFE_NO_PAD.encode(&point[32..]),
        )
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Claims that pass every check with the default test configuration.
pub fn standard_claims() -> serde_json::Value {
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "user-123",
        "oid": "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee",
        "scp": format!("{REQUIRED_SCOPE} profile"),
        "iat": now_secs(),
        "exp": now_secs() + 3600,
    })
}

/// Flip one character of the payload segment, keeping the token structurally
/// intact so the failure is the signature check and nothing earlier.
pub fn tamper_payload(token: &str) -> String {
    let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
    assert_eq!(parts.len(), 3);
    let payload = &mut parts[1];
    let target = payload.len() / 2;
    let original = payload.as_bytes()[target];
    let replacement = if original == b'A' { b'B' } else { b'A' };
    payload.replace_range(target..=target, &(replacement as char).to_string());
    parts.join(".")
}
