//! Ed25519 webhook signature verification.
//!
//! Providers sign the raw request body; the engine holds only their public
//! keys (hex in config). The signature travels base64-encoded in `X-Signature`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("public key is not valid hex ed25519: {0}")]
    BadKey(String),

    #[error("signature is not valid base64 or has wrong length")]
    Malformed,

    #[error("signature does not match body")]
    Mismatch,
}

/// A provider's verifying key
#[derive(Debug, Clone)]
pub struct WebhookKey(VerifyingKey);

impl WebhookKey {
    /// Parse a 32-byte public key from hex
    pub fn from_hex(hex_key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| SignatureError::BadKey(e.to_string()))?;
        let pk: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::BadKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        VerifyingKey::from_bytes(&pk)
            .map(Self)
            .map_err(|e| SignatureError::BadKey(e.to_string()))
    }

    /// Verify a base64 signature over the exact body bytes
    pub fn verify(&self, body: &[u8], signature_b64: &str) -> Result<(), SignatureError> {
        let raw = BASE64
            .decode(signature_b64.trim())
            .map_err(|_| SignatureError::Malformed)?;
        let sig_bytes: [u8; 64] = raw.as_slice().try_into().map_err(|_| SignatureError::Malformed)?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.0.verify(body, &sig).map_err(|_| SignatureError::Mismatch)
    }
}

/// Generate a keypair for tests. Returns (private_key, public_key_hex).
#[cfg(any(test, feature = "mock-api"))]
pub fn generate_keypair() -> ([u8; 32], String) {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    let signing_key = SigningKey::generate(&mut OsRng);
    let public_hex = hex::encode(signing_key.verifying_key().as_bytes());
    (signing_key.to_bytes(), public_hex)
}

/// Sign a body the way a provider does, returning the header value.
#[cfg(any(test, feature = "mock-api"))]
pub fn sign_body(private_key: &[u8; 32], body: &[u8]) -> String {
    use ed25519_dalek::{Signer, SigningKey};

    let signing_key = SigningKey::from_bytes(private_key);
    BASE64.encode(signing_key.sign(body).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_valid_signature() {
        let (private_key, public_hex) = generate_keypair();
        let key = WebhookKey::from_hex(&public_hex).unwrap();
        let body = br#"{"transactionId":"x","status":"completed"}"#;

        let sig = sign_body(&private_key, body);
        assert!(key.verify(body, &sig).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (private_key, public_hex) = generate_keypair();
        let key = WebhookKey::from_hex(&public_hex).unwrap();
        let sig = sign_body(&private_key, br#"{"status":"failed"}"#);

        assert_eq!(
            key.verify(br#"{"status":"completed"}"#, &sig),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (private_key, _) = generate_keypair();
        let (_, other_hex) = generate_keypair();
        let key = WebhookKey::from_hex(&other_hex).unwrap();
        let sig = sign_body(&private_key, b"body");

        assert_eq!(key.verify(b"body", &sig), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_malformed_signature() {
        let (_, public_hex) = generate_keypair();
        let key = WebhookKey::from_hex(&public_hex).unwrap();

        assert_eq!(key.verify(b"body", "not base64!!"), Err(SignatureError::Malformed));
        // valid base64, 32 bytes instead of 64
        let short = BASE64.encode([0u8; 32]);
        assert_eq!(key.verify(b"body", &short), Err(SignatureError::Malformed));
    }

    #[test]
    fn test_bad_public_key() {
        assert!(matches!(WebhookKey::from_hex("zz"), Err(SignatureError::BadKey(_))));
        assert!(matches!(
            WebhookKey::from_hex(&hex::encode([1u8; 16])),
            Err(SignatureError::BadKey(_))
        ));
    }
}
