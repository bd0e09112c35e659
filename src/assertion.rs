//! Client-assertion signing for the certificate-bound token exchange.
//!
//! The client proves possession of the private key paired with its uploaded
//! X.509 certificate by sending a short-lived signed JWT (`client_assertion`)
//! instead of a shared secret. Material is loaded once at startup and fails
//! fast on unreadable files or a thumbprint that does not match the
//! certificate; a file watcher can swap in re-uploaded material without a
//! restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use x509_parser::pem::Pem;

use crate::config::{ClientConfig, MAX_ASSERTION_VALIDITY};
use crate::{Error, Result};

/// Private key plus derived certificate identity, loaded as one unit.
pub struct ClientCredentialMaterial {
    key: EncodingKey,
    algorithm: Algorithm,
    /// SHA-256 over the certificate DER, hex-encoded.
    thumbprint_hex: String,
    /// Same digest, base64url for the `x5t#S256` assertion header.
    thumbprint_b64: String,
    subject: String,
}

impl ClientCredentialMaterial {
    /// Load from PEM files. `key_path` may be omitted when the certificate
    /// file is a bundle that also carries the private-key block.
    pub fn load(cert_path: &Path, key_path: Option<&Path>) -> Result<Self> {
        let cert_text = std::fs::read_to_string(cert_path)?;

        let (der, subject) = parse_certificate(&cert_text, cert_path)?;
        let digest = Sha256::digest(&der).to_vec();
        let thumbprint_hex = hex::encode(&digest);
        let thumbprint_b64 = URL_SAFE_NO_PAD.encode(&digest);

        let key_text = match key_path {
            Some(p) => std::fs::read_to_string(p)?,
            None => cert_text,
        };
        let key_block = find_private_key_block(&key_text).ok_or_else(|| {
            Error::Config("no private-key PEM block found in credential files".to_string())
        })?;
        let (key, algorithm) = parse_private_key(key_block)?;

        debug!(subject = %subject, thumbprint = %thumbprint_hex, "Client credential material loaded");
        Ok(Self {
            key,
            algorithm,
            thumbprint_hex,
            thumbprint_b64,
            subject,
        })
    }

    /// Hex-encoded SHA-256 thumbprint of the certificate.
    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint_hex
    }

    /// Certificate subject, for operator logs.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// A signed client assertion ready to be posted to the token endpoint.
pub struct SignedAssertion {
    /// The serialized JWT.
    pub jwt: String,
    /// Expiry of the assertion (Unix timestamp).
    pub expires_at: u64,
}

impl std::fmt::Debug for SignedAssertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedAssertion")
            .field("jwt", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: u64,
    nbf: u64,
    exp: u64,
}

/// Signs client assertions with the loaded credential material.
pub struct CredentialSigner {
    material: RwLock<Arc<ClientCredentialMaterial>>,
    client_id: String,
    validity: Duration,
    cert_path: PathBuf,
    key_path: Option<PathBuf>,
    expected_thumbprint: Option<String>,
}

impl CredentialSigner {
    /// Load material per the client configuration, failing fast on
    /// unreadable files or a thumbprint mismatch.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let cert_path = PathBuf::from(&config.certificate_path);
        let key_path = config.private_key_path.as_ref().map(PathBuf::from);
        let expected_thumbprint = config
            .certificate_thumbprint
            .as_deref()
            .map(normalize_thumbprint);

        let material = ClientCredentialMaterial::load(&cert_path, key_path.as_deref())?;
        check_thumbprint(&material, expected_thumbprint.as_deref())?;
        info!(subject = %material.subject(), "Credential signer initialized");

        Ok(Self {
            material: RwLock::new(Arc::new(material)),
            client_id: config.client_id.clone(),
            validity: config.assertion_validity.min(MAX_ASSERTION_VALIDITY),
            cert_path,
            key_path,
            expected_thumbprint,
        })
    }

    /// Produce a fresh assertion bound to `audience` (the token endpoint).
    ///
    /// Every call mints a unique assertion id; reusing one is a protocol
    /// violation the issuing server may reject.
    pub fn sign(&self, audience: &str) -> Result<SignedAssertion> {
        let material = Arc::clone(&self.material.read());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let expires_at = now + self.validity.as_secs();

        let claims = AssertionClaims {
            iss: &self.client_id,
            sub: &self.client_id,
            aud: audience,
            jti: format!("{}.{now}", uuid::Uuid::new_v4()),
            iat: now,
            nbf: now,
            exp: expires_at,
        };

        let mut header = Header::new(material.algorithm);
        header.x5t_s256 = Some(material.thumbprint_b64.clone());

        let jwt = jsonwebtoken::encode(&header, &claims, &material.key)
            .map_err(|e| Error::Config(format!("assertion signing failed: {e}")))?;

        Ok(SignedAssertion { jwt, expires_at })
    }

    /// Re-load material from disk, keeping the previous material if the new
    /// files are unreadable or fail the thumbprint check.
    pub fn reload(&self) -> Result<()> {
        let material = ClientCredentialMaterial::load(&self.cert_path, self.key_path.as_deref())?;
        check_thumbprint(&material, self.expected_thumbprint.as_deref())?;
        *self.material.write() = Arc::new(material);
        Ok(())
    }

    /// Watch the credential files and hot-reload on change.
    ///
    /// The returned watcher must be kept alive for as long as reloads are
    /// wanted. A change that fails validation is logged and ignored; the
    /// previous material stays active.
    pub fn watch(self: &Arc<Self>) -> Result<RecommendedWatcher> {
        let signer = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                match signer.reload() {
                    Ok(()) => info!("Client credential material reloaded"),
                    Err(e) => {
                        warn!(error = %e, "Credential reload failed, keeping previous material");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Credential watcher error"),
        })
        .map_err(|e| Error::Config(format!("failed to create credential watcher: {e}")))?;

        watcher
            .watch(&self.cert_path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("failed to watch certificate file: {e}")))?;
        if let Some(key_path) = &self.key_path {
            watcher
                .watch(key_path, RecursiveMode::NonRecursive)
                .map_err(|e| Error::Config(format!("failed to watch key file: {e}")))?;
        }
        Ok(watcher)
    }

    /// Hex thumbprint of the currently loaded certificate.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        self.material.read().thumbprint_hex.clone()
    }
}

/// Parse the first CERTIFICATE block; returns its DER bytes and subject.
fn parse_certificate(pem_text: &str, path: &Path) -> Result<(Vec<u8>, String)> {
    for block in Pem::iter_from_buffer(pem_text.as_bytes()) {
        let block =
            block.map_err(|e| Error::Config(format!("invalid PEM in {}: {e}", path.display())))?;
        if block.label != "CERTIFICATE" {
            continue;
        }
        let cert = block
            .parse_x509()
            .map_err(|e| Error::Config(format!("invalid certificate in {}: {e}", path.display())))?;
        if !cert.validity().is_valid() {
            warn!(path = %path.display(), "Client certificate is outside its validity period");
        }
        let subject = cert.subject().to_string();
        return Ok((block.contents.clone(), subject));
    }
    Err(Error::Config(format!(
        "no CERTIFICATE block found in {}",
        path.display()
    )))
}

/// Locate a private-key PEM block inside possibly-bundled PEM text.
fn find_private_key_block(pem_text: &str) -> Option<&str> {
    for label in ["PRIVATE KEY", "RSA PRIVATE KEY", "EC PRIVATE KEY"] {
        let begin = format!("-----BEGIN {label}-----");
        let end = format!("-----END {label}-----");
        if let Some(start) = pem_text.find(&begin) {
            if let Some(stop) = pem_text[start..].find(&end) {
                return Some(&pem_text[start..start + stop + end.len()]);
            }
        }
    }
    None
}

/// Build an [`EncodingKey`] from a key PEM block, picking the signing
/// algorithm from the key type.
fn parse_private_key(key_block: &str) -> Result<(EncodingKey, Algorithm)> {
    if let Ok(key) = EncodingKey::from_rsa_pem(key_block.as_bytes()) {
        return Ok((key, Algorithm::RS256));
    }
    if let Ok(key) = EncodingKey::from_ec_pem(key_block.as_bytes()) {
        return Ok((key, Algorithm::ES256));
    }
    Err(Error::Config(
        "private key is neither a usable RSA nor EC key".to_string(),
    ))
}

/// Strip separators and case from an operator-supplied thumbprint.
fn normalize_thumbprint(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn check_thumbprint(
    material: &ClientCredentialMaterial,
    expected: Option<&str>,
) -> Result<()> {
    if let Some(expected) = expected {
        if material.thumbprint_hex != expected {
            return Err(Error::Config(
                "configured certificate thumbprint does not match the certificate on disk"
                    .to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use jsonwebtoken::{DecodingKey, Validation};
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct DecodedAssertion {
        iss: String,
        sub: String,
        aud: String,
        jti: String,
        iat: u64,
        exp: u64,
    }

    struct TestCredential {
        bundle: tempfile::NamedTempFile,
        public_key_pem: String,
        thumbprint_hex: String,
    }

    /// Self-signed ES256 certificate with the key bundled alongside it.
    fn generate_credential() -> TestCredential {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::default()
            .self_signed(&key_pair)
            .unwrap();

        let cert_pem = cert.pem();
        let der = cert.der();
        let thumbprint_hex = hex::encode(Sha256::digest(der.as_ref()));

        let mut bundle = tempfile::NamedTempFile::new().unwrap();
        write!(bundle, "{}{}", key_pair.serialize_pem(), cert_pem).unwrap();

        TestCredential {
            bundle,
            public_key_pem: key_pair.public_key_pem(),
            thumbprint_hex,
        }
    }

    fn signer_config(credential: &TestCredential) -> ClientConfig {
        ClientConfig {
            client_id: "11111111-2222-3333-4444-555555555555".to_string(),
            certificate_path: credential.bundle.path().display().to_string(),
            assertion_validity: Duration::from_secs(300),
            ..ClientConfig::default()
        }
    }

    fn decode_assertion(jwt: &str, credential: &TestCredential, audience: &str) -> DecodedAssertion {
        let key = DecodingKey::from_ec_pem(credential.public_key_pem.as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[audience]);
        jsonwebtoken::decode::<DecodedAssertion>(jwt, &key, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn assertion_binds_client_identity_and_audience() {
        let credential = generate_credential();
        let signer = CredentialSigner::from_config(&signer_config(&credential)).unwrap();

        let assertion = signer.sign("https://login.example.com/token").unwrap();
        let claims = decode_assertion(&assertion.jwt, &credential, "https://login.example.com/token");

        assert_eq!(claims.iss, "11111111-2222-3333-4444-555555555555");
        assert_eq!(claims.sub, claims.iss);
        assert_eq!(claims.aud, "https://login.example.com/token");
        assert_eq!(claims.exp, assertion.expires_at);
    }

    #[test]
    fn assertion_lifetime_never_exceeds_ten_minutes() {
        let credential = generate_credential();
        let mut config = signer_config(&credential);
        // from_config clamps even if validation was bypassed
        config.assertion_validity = Duration::from_secs(3600);
        let signer = CredentialSigner::from_config(&config).unwrap();

        let assertion = signer.sign("https://login.example.com/token").unwrap();
        let claims = decode_assertion(&assertion.jwt, &credential, "https://login.example.com/token");
        assert!(claims.exp - claims.iat <= 600);
    }

    #[test]
    fn assertion_ids_are_unique_per_call() {
        let credential = generate_credential();
        let signer = CredentialSigner::from_config(&signer_config(&credential)).unwrap();

        let first = signer.sign("https://login.example.com/token").unwrap();
        let second = signer.sign("https://login.example.com/token").unwrap();

        let a = decode_assertion(&first.jwt, &credential, "https://login.example.com/token");
        let b = decode_assertion(&second.jwt, &credential, "https://login.example.com/token");
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn assertion_header_carries_certificate_thumbprint() {
        let credential = generate_credential();
        let signer = CredentialSigner::from_config(&signer_config(&credential)).unwrap();

        let assertion = signer.sign("https://login.example.com/token").unwrap();
        let header = jsonwebtoken::decode_header(&assertion.jwt).unwrap();

        let expected = URL_SAFE_NO_PAD.encode(hex::decode(&credential.thumbprint_hex).unwrap());
        assert_eq!(header.x5t_s256.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn matching_thumbprint_config_is_accepted_case_insensitively() {
        let credential = generate_credential();
        let mut config = signer_config(&credential);
        config.certificate_thumbprint = Some(credential.thumbprint_hex.to_ascii_uppercase());
        assert!(CredentialSigner::from_config(&config).is_ok());
    }

    #[test]
    fn mismatched_thumbprint_fails_fast() {
        let credential = generate_credential();
        let mut config = signer_config(&credential);
        config.certificate_thumbprint = Some("00".repeat(32));
        assert!(matches!(
            CredentialSigner::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_certificate_block_fails_fast() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let mut key_only = tempfile::NamedTempFile::new().unwrap();
        write!(key_only, "{}", key_pair.serialize_pem()).unwrap();

        let config = ClientConfig {
            client_id: "client".to_string(),
            certificate_path: key_only.path().display().to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            CredentialSigner::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn reload_swaps_in_reuploaded_material() {
        let credential = generate_credential();
        let signer = CredentialSigner::from_config(&signer_config(&credential)).unwrap();
        let original = signer.thumbprint();

        let replacement = generate_credential();
        std::fs::copy(replacement.bundle.path(), credential.bundle.path()).unwrap();
        signer.reload().unwrap();

        assert_ne!(signer.thumbprint(), original);
        assert_eq!(signer.thumbprint(), replacement.thumbprint_hex);
    }

    #[test]
    fn reload_keeps_previous_material_on_bad_replacement() {
        let credential = generate_credential();
        let signer = CredentialSigner::from_config(&signer_config(&credential)).unwrap();
        let original = signer.thumbprint();

        std::fs::write(credential.bundle.path(), "not pem at all").unwrap();
        assert!(signer.reload().is_err());
        assert_eq!(signer.thumbprint(), original);

        // Signing still works with the retained material.
        assert!(signer.sign("https://login.example.com/token").is_ok());
    }
}
