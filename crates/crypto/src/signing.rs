//! Signing and verification of canonical objects.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical;

/// Errors raised by crypto operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature bytes malformed or verification failed
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Public key bytes malformed
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// Canonical serialization failed
    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    /// Key file I/O failure
    #[error("key storage error: {0}")]
    KeyStorage(#[from] std::io::Error),
}

/// A signature attached to a signed object, identifying the signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Identifier of the signing key
    pub key_id: String,
    /// Base64-encoded Ed25519 signature
    pub sig: String,
}

/// Sign a serializable object, producing a [`SignatureEntry`].
///
/// The object is canonicalized with its `signatures`/`signature` field
/// removed before signing, so the produced signature can later be
/// attached to the object without invalidating itself.
pub fn sign_object<T: Serialize>(
    object: &T,
    signing_key: &SigningKey,
    key_id: &str,
) -> Result<SignatureEntry, CryptoError> {
    let message = canonical::signing_bytes(object)?;
    let signature = signing_key.sign(&message);
    Ok(SignatureEntry {
        key_id: key_id.to_string(),
        sig: BASE64.encode(signature.to_bytes()),
    })
}

/// Verify a [`SignatureEntry`] over an object's canonical bytes.
pub fn verify_object<T: Serialize>(
    object: &T,
    entry: &SignatureEntry,
    public_key_b64: &str,
) -> Result<(), CryptoError> {
    let message = canonical::signing_bytes(object)?;
    verify_raw(&message, &entry.sig, public_key_b64)
}

/// Verify a base64 signature over raw message bytes.
pub fn verify_raw(
    message: &[u8],
    signature_b64: &str,
    public_key_b64: &str,
) -> Result<(), CryptoError> {
    let verifying_key = decode_public_key(public_key_b64)?;

    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|e| CryptoError::BadSignature(format!("signature not base64: {}", e)))?;
    let sig_array: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::BadSignature(format!("expected 64 bytes, got {}", sig_bytes.len())))?;
    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(message, &signature)
        .map_err(|e| CryptoError::BadSignature(e.to_string()))
}

/// Decode a base64-encoded Ed25519 verifying key.
pub fn decode_public_key(public_key_b64: &str) -> Result<VerifyingKey, CryptoError> {
    let key_bytes = BASE64
        .decode(public_key_b64)
        .map_err(|e| CryptoError::InvalidKey(format!("not base64: {}", e)))?;
    let key_array: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", key_bytes.len())))?;
    VerifyingKey::from_bytes(&key_array).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use serde_json::json;

    #[derive(Serialize)]
    struct Doc {
        name: String,
        value: u64,
        signatures: Vec<SignatureEntry>,
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = KeyPair::generate();
        let doc = Doc {
            name: "alpha".to_string(),
            value: 7,
            signatures: vec![],
        };

        let entry = sign_object(&doc, keypair.signing_key(), keypair.key_id()).unwrap();
        assert!(verify_object(&doc, &entry, &keypair.public_key_b64()).is_ok());
    }

    #[test]
    fn test_signature_survives_attachment() {
        // Attaching the produced signature must not invalidate it, since
        // the signatures field is excluded from the signed payload.
        let keypair = KeyPair::generate();
        let mut doc = Doc {
            name: "alpha".to_string(),
            value: 7,
            signatures: vec![],
        };

        let entry = sign_object(&doc, keypair.signing_key(), keypair.key_id()).unwrap();
        doc.signatures.push(entry.clone());
        assert!(verify_object(&doc, &entry, &keypair.public_key_b64()).is_ok());
    }

    #[test]
    fn test_tampered_object_fails() {
        let keypair = KeyPair::generate();
        let doc = Doc {
            name: "alpha".to_string(),
            value: 7,
            signatures: vec![],
        };
        let entry = sign_object(&doc, keypair.signing_key(), keypair.key_id()).unwrap();

        let tampered = Doc {
            name: "alpha".to_string(),
            value: 8,
            signatures: vec![],
        };
        let result = verify_object(&tampered, &entry, &keypair.public_key_b64());
        assert!(matches!(result, Err(CryptoError::BadSignature(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let doc = json!({"a": 1});

        let entry = sign_object(&doc, keypair.signing_key(), keypair.key_id()).unwrap();
        let result = verify_object(&doc, &entry, &other.public_key_b64());
        assert!(matches!(result, Err(CryptoError::BadSignature(_))));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let keypair = KeyPair::generate();
        let entry = SignatureEntry {
            key_id: "k".to_string(),
            sig: BASE64.encode([0u8; 10]),
        };
        let result = verify_object(&json!({"a": 1}), &entry, &keypair.public_key_b64());
        assert!(matches!(result, Err(CryptoError::BadSignature(_))));
    }

    #[test]
    fn test_malformed_public_key_rejected() {
        assert!(matches!(
            decode_public_key("@@not-base64@@"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            decode_public_key(&BASE64.encode([0u8; 16])),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_deterministic_signing() {
        let keypair = KeyPair::from_seed(&[42u8; 32]);
        let doc = json!({"b": 2, "a": 1});

        let sig1 = sign_object(&doc, keypair.signing_key(), keypair.key_id()).unwrap();
        let sig2 = sign_object(&doc, keypair.signing_key(), keypair.key_id()).unwrap();
        assert_eq!(sig1.sig, sig2.sig);
    }
}
