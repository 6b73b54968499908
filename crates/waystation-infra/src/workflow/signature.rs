//! HMAC-SHA256 trigger signatures.
//!
//! A signed trigger carries `x-waystation-signature: sha256=<hex>` computed
//! over the raw request body with the engine's signing key. The same key
//! signs continuations the engine delivers to itself.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use waystation_core::workflow::error::AuthError;
use waystation_core::workflow::fingerprint::hex_encode;
use waystation_core::workflow::gateway::{RequestVerifier, SIGNATURE_HEADER};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// `sha256=<hex>` signature of `body` under `key`.
pub fn sign_body(key: &SecretString, body: &[u8]) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key.expose_secret().as_bytes())
        .map_err(|e| AuthError::Malformed(format!("invalid signing key: {e}")))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex_encode(&mac.finalize().into_bytes())
    ))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verifies `x-waystation-signature` against the configured key.
pub struct HmacRequestVerifier {
    key: SecretString,
}

impl HmacRequestVerifier {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }
}

impl std::fmt::Debug for HmacRequestVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacRequestVerifier")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl RequestVerifier for HmacRequestVerifier {
    fn verify(&self, headers: &BTreeMap<String, String>, body: &[u8]) -> Result<(), AuthError> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or(AuthError::MissingSignature)?;
        let hex = header
            .trim()
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or_else(|| AuthError::Malformed(format!("expected '{SIGNATURE_PREFIX}<hex>'")))?;
        let expected = hex_decode(hex)
            .ok_or_else(|| AuthError::Malformed("signature is not valid hex".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|e| AuthError::Malformed(format!("invalid signing key: {e}")))?;
        mac.update(body);
        // Constant-time comparison.
        mac.verify_slice(&expected).map_err(|_| AuthError::Mismatch)
    }
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
