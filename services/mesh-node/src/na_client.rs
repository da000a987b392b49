//! Network Authority HTTP client.
//!
//! The NA is a remote signer: it publishes the genesis block, policy
//! manifest, and CRL, and issues join certificates against a
//! proof-of-possession signature over a server-provided nonce. Every
//! signed response is verified against the genesis-embedded NA key
//! before use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::Signer;
use genesis_mesh_control::{CertificateRenewer, RenewalError};
use genesis_mesh_crypto::KeyPair;
use genesis_mesh_domain::{Crl, GenesisBlock, JoinCertificate, PolicyManifest, TrustChain};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Deadline for certificate issuance and renewal.
const ISSUE_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for document fetches (genesis, policy, CRL, nonce).
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Network Authority client failures.
#[derive(Debug, Error)]
pub enum NaError {
    /// HTTP transport failure
    #[error("network authority unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response failed signature verification
    #[error("network authority response failed verification: {0}")]
    Verification(String),

    /// The authority refused the request
    #[error("network authority rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Serialize)]
struct JoinRequest<'a> {
    node_public_key: &'a str,
    roles: &'a [String],
    validity_hours: u64,
    nonce: &'a str,
    pop_signature: String,
}

#[derive(Debug, Serialize)]
struct RenewRequest<'a> {
    current_cert: &'a JoinCertificate,
    nonce: &'a str,
    pop_signature: String,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: String,
}

/// HTTP client for the Network Authority API.
pub struct NaClient {
    http: reqwest::Client,
    base_url: String,
    keypair: Arc<KeyPair>,
    trust: TrustChain,
}

impl NaClient {
    /// Client bound to one authority endpoint and our identity key.
    pub fn new(base_url: &str, keypair: Arc<KeyPair>, trust: TrustChain) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            keypair,
            trust,
        }
    }

    /// Fetch the genesis block (used at first boot, before a trust chain
    /// exists; verification happens in `TrustChain::import`).
    pub async fn fetch_genesis(http: &reqwest::Client, base_url: &str) -> Result<GenesisBlock, NaError> {
        let url = format!("{}/genesis", base_url.trim_end_matches('/'));
        let genesis = http
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<GenesisBlock>()
            .await?;
        Ok(genesis)
    }

    /// Fetch and verify the current policy manifest.
    pub async fn fetch_policy(&self) -> Result<PolicyManifest, NaError> {
        let policy = self
            .http
            .get(format!("{}/policy", self.base_url))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<PolicyManifest>()
            .await?;
        self.trust
            .verify_policy(&policy)
            .map_err(|e| NaError::Verification(e.to_string()))?;
        Ok(policy)
    }

    /// Fetch and verify the current CRL.
    pub async fn fetch_crl(&self) -> Result<Crl, NaError> {
        let crl = self
            .http
            .get(format!("{}/crl", self.base_url))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<Crl>()
            .await?;
        self.trust
            .verify_crl(&crl)
            .map_err(|e| NaError::Verification(e.to_string()))?;
        Ok(crl)
    }

    /// Request a join certificate for our key with the given roles.
    pub async fn join(
        &self,
        roles: &[String],
        validity_hours: u64,
        now: u64,
    ) -> Result<JoinCertificate, NaError> {
        let nonce = self.fetch_nonce().await?;
        let pop_signature = self.prove_possession(&nonce);
        let public_key = self.keypair.public_key_b64();

        let request = JoinRequest {
            node_public_key: &public_key,
            roles,
            validity_hours,
            nonce: &nonce,
            pop_signature,
        };

        let cert = self
            .http
            .post(format!("{}/join", self.base_url))
            .timeout(ISSUE_TIMEOUT)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<JoinCertificate>()
            .await?;

        self.verify_issued(&cert, now)?;
        info!(cert_id = %cert.cert_id, expires_at = cert.expires_at, "join certificate issued");
        Ok(cert)
    }

    /// Request a successor certificate.
    pub async fn renew(
        &self,
        current: &JoinCertificate,
        now: u64,
    ) -> Result<JoinCertificate, NaError> {
        let nonce = self.fetch_nonce().await?;
        let pop_signature = self.prove_possession(&nonce);

        let request = RenewRequest {
            current_cert: current,
            nonce: &nonce,
            pop_signature,
        };

        let cert = self
            .http
            .post(format!("{}/renew", self.base_url))
            .timeout(ISSUE_TIMEOUT)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<JoinCertificate>()
            .await?;

        self.verify_issued(&cert, now)?;
        Ok(cert)
    }

    async fn fetch_nonce(&self) -> Result<String, NaError> {
        let response = self
            .http
            .get(format!("{}/nonce", self.base_url))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<NonceResponse>()
            .await?;
        Ok(response.nonce)
    }

    /// Proof of possession: sign the authority's nonce with our key.
    fn prove_possession(&self, nonce: &str) -> String {
        let signature = self.keypair.signing_key().sign(nonce.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    fn verify_issued(&self, cert: &JoinCertificate, now: u64) -> Result<(), NaError> {
        if cert.node_public_key != self.keypair.public_key_b64() {
            return Err(NaError::Verification(
                "issued certificate binds a different key".to_string(),
            ));
        }
        self.trust
            .verify_certificate(cert, now, None)
            .map_err(|e| NaError::Verification(e.to_string()))
    }
}

#[async_trait]
impl CertificateRenewer for NaClient {
    async fn renew(&self, current: &JoinCertificate) -> Result<JoinCertificate, RenewalError> {
        let now = genesis_mesh_core::time::unix_ms();
        NaClient::renew(self, current, now).await.map_err(|e| match e {
            NaError::Transport(inner) if inner.is_timeout() => RenewalError::Timeout,
            NaError::Transport(inner) => RenewalError::Io(inner.to_string()),
            NaError::Verification(reason) => {
                warn!(%reason, "authority returned an unverifiable certificate");
                RenewalError::InvalidCertificate(reason)
            }
            NaError::Rejected(reason) => RenewalError::Rejected(reason),
        })
    }
}
