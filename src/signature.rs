//! HMAC-SHA256 webhook signatures
//!
//! Signatures are the lowercase hex HMAC-SHA256 of the raw request body.
//! Comparison is constant time via [`Mac::verify_slice`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check `provided_signature` against the HMAC of `payload`.
///
/// Returns false for an empty secret or a signature that is not valid hex,
/// never panics.
pub fn validate(payload: &[u8], provided_signature: &str, shared_secret: &str) -> bool {
    if shared_secret.is_empty() {
        return false;
    }

    let Ok(provided) = hex::decode(provided_signature.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Hex HMAC-SHA256 of `payload`
pub fn sign(payload: &[u8], shared_secret: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret.as_bytes()) else {
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Random 256-bit secret, URL-safe base64
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Holds the configured webhook secret
#[derive(Clone)]
pub struct SignatureValidator {
    secret: String,
}

impl SignatureValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn verify(&self, payload: &[u8], provided_signature: &str) -> bool {
        validate(payload, provided_signature, &self.secret)
    }
}

impl std::fmt::Debug for SignatureValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureValidator")
            .field("configured", &self.is_configured())
            .finish()
    }
}
