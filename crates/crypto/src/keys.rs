//! Ed25519 identity key management.
//!
//! Keys are stored as base64 under `keys/node.key` / `keys/node.pub` with
//! a comment header; the private key file is restricted to owner access.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroize;

use crate::signing::CryptoError;

/// A base64-encoded Ed25519 verifying key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(pub String);

impl PublicKey {
    /// Raw key bytes.
    pub fn to_bytes(&self) -> Result<[u8; 32], CryptoError> {
        let bytes = BASE64
            .decode(&self.0)
            .map_err(|e| CryptoError::InvalidKey(format!("not base64: {}", e)))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
    }
}

/// Ed25519 key pair backing a node identity.
pub struct KeyPair {
    signing_key: SigningKey,
    key_id: String,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let keypair = Self::from_seed(&seed);
        seed.zeroize();
        keypair
    }

    /// Construct a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let key_id = derive_key_id(&signing_key.verifying_key());
        Self {
            signing_key,
            key_id,
        }
    }

    /// Construct a key pair from raw private key bytes.
    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut seed: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", key_bytes.len())))?;
        let keypair = Self::from_seed(&seed);
        seed.zeroize();
        Ok(keypair)
    }

    /// The signing key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Base64-encoded public key. This doubles as the node's identity.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    /// Stable key identifier: hex of the first 16 bytes of the BLAKE3 hash
    /// of the public key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Persist the key pair under `base_dir` as `node.key` / `node.pub`.
    pub fn save(&self, private_path: &Path, public_path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = private_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = public_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let private_body = format!(
            "# Ed25519 private key\n# Key ID: {}\n{}\n",
            self.key_id,
            BASE64.encode(self.signing_key.to_bytes())
        );
        std::fs::write(private_path, private_body)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(private_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let public_body = format!(
            "# Ed25519 public key\n# Key ID: {}\n{}\n",
            self.key_id,
            self.public_key_b64()
        );
        std::fs::write(public_path, public_body)?;
        Ok(())
    }

    /// Load a key pair from a private key file written by [`KeyPair::save`].
    pub fn load(private_path: &Path) -> Result<Self, CryptoError> {
        let content = std::fs::read_to_string(private_path)?;
        let body: String = content
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("");
        let mut key_bytes = BASE64
            .decode(body.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("key file not base64: {}", e)))?;
        let keypair = Self::from_bytes(&key_bytes);
        key_bytes.zeroize();
        keypair
    }

    /// Load an existing key pair, or generate and persist a new one.
    pub fn load_or_generate(
        private_path: &Path,
        public_path: &Path,
    ) -> Result<(Self, bool), CryptoError> {
        if private_path.exists() {
            Ok((Self::load(private_path)?, false))
        } else {
            let keypair = Self::generate();
            keypair.save(private_path, public_path)?;
            Ok((keypair, true))
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Derive a key identifier from a verifying key.
pub fn derive_key_id(verifying_key: &VerifyingKey) -> String {
    let hash = blake3::hash(verifying_key.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}

/// Derive the key identifier for a base64-encoded public key.
pub fn key_id_for_b64(public_key_b64: &str) -> Result<String, CryptoError> {
    let bytes = BASE64
        .decode(public_key_b64)
        .map_err(|e| CryptoError::InvalidKey(format!("not base64: {}", e)))?;
    Ok(hex::encode(&blake3::hash(&bytes).as_bytes()[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_key_b64(), b.public_key_b64());
        assert_ne!(a.key_id(), b.key_id());
    }

    #[test]
    fn test_from_seed_deterministic() {
        let a = KeyPair::from_seed(&[7u8; 32]);
        let b = KeyPair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key_b64(), b.public_key_b64());
        assert_eq!(a.key_id(), b.key_id());
    }

    #[test]
    fn test_key_id_is_32_hex_chars() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.key_id().len(), 32);
        assert!(keypair.key_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let private_path = dir.path().join("keys").join("node.key");
        let public_path = dir.path().join("keys").join("node.pub");

        let original = KeyPair::generate();
        original.save(&private_path, &public_path).unwrap();

        let loaded = KeyPair::load(&private_path).unwrap();
        assert_eq!(loaded.public_key_b64(), original.public_key_b64());
        assert_eq!(loaded.key_id(), original.key_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let private_path = dir.path().join("node.key");
        let public_path = dir.path().join("node.pub");

        KeyPair::generate().save(&private_path, &public_path).unwrap();

        let mode = std::fs::metadata(&private_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_or_generate_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let private_path = dir.path().join("node.key");
        let public_path = dir.path().join("node.pub");

        let (first, created) = KeyPair::load_or_generate(&private_path, &public_path).unwrap();
        assert!(created);

        let (second, created) = KeyPair::load_or_generate(&private_path, &public_path).unwrap();
        assert!(!created);
        assert_eq!(first.public_key_b64(), second.public_key_b64());
    }

    #[test]
    fn test_public_key_wrapper_roundtrip() {
        let keypair = KeyPair::generate();
        let wrapped = PublicKey(keypair.public_key_b64());
        assert_eq!(wrapped.to_bytes().unwrap(), keypair.verifying_key().to_bytes());
    }
}
