//! Genesis Mesh Crypto - Trust Layer Primitives
//!
//! Ed25519 key management, canonical JSON serialization, and the
//! sign/verify operations shared by every signed object in the mesh.
//!
//! # Security Model
//!
//! - All signature-bearing objects are canonicalized before signing
//! - The `signatures`/`signature` field is excluded from the signed payload
//! - Sign and verify use the same canonicalizer, so signatures are
//!   reproducible across nodes
//! - Private key bytes are zeroized after use

#![warn(missing_docs)]

pub mod canonical;
pub mod keys;
pub mod signing;

pub use canonical::{signing_bytes, to_canonical_json};
pub use keys::{KeyPair, PublicKey};
pub use signing::{sign_object, verify_object, verify_raw, CryptoError, SignatureEntry};

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
