//! Genesis Mesh node entry point.
//!
//! Bootstrap order: configuration, identity keys, genesis import and
//! verification, audit chain verification, certificate acquisition,
//! then the node runtime. Exit codes: 0 clean, 1 configuration error,
//! 2 genesis rejected, 3 certificate unobtainable, 4 fatal internal
//! error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use genesis_mesh_audit::{spawn_audit_writer, AuditError, AuditLog};
use genesis_mesh_control::{CertManager, RenewalSchedule};
use genesis_mesh_core::{
    logging, time, NodeConfig, EXIT_CERT, EXIT_CONFIG, EXIT_FATAL, EXIT_OK, EXIT_TRUST,
};
use genesis_mesh_crypto::KeyPair;
use genesis_mesh_domain::TrustChain;

use mesh_node::na_client::NaClient;
use mesh_node::node::{MeshNode, NodeExit, NodeSeed};
use mesh_node::state;

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    logging::init();

    let config_path = match parse_config_path() {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{}", message);
            return EXIT_CONFIG;
        }
    };

    let config = match NodeConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "invalid configuration");
            return EXIT_CONFIG;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return EXIT_FATAL;
        }
    };

    runtime.block_on(run_node(config))
}

fn parse_config_path() -> Result<PathBuf, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            return iter
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "--config was provided without a path".to_string());
        }
    }
    Err(format!(
        "usage: {} --config <path>",
        args.first().map(String::as_str).unwrap_or("mesh-node")
    ))
}

async fn run_node(config: NodeConfig) -> i32 {
    if let Err(e) = state::ensure_layout(&config) {
        error!(error = %e, "cannot create data directories");
        return EXIT_CONFIG;
    }

    // Identity keys.
    let (keypair, generated) =
        match KeyPair::load_or_generate(&config.key_path(), &config.pub_path()) {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "cannot load identity keys");
                return EXIT_CONFIG;
            }
        };
    let keypair = Arc::new(keypair);
    if generated {
        info!(key_id = keypair.key_id(), "generated new identity key");
    }

    // Genesis: local copy first, otherwise fetch from the authority.
    let now = time::unix_ms();
    let genesis = match state::load_genesis(&config) {
        Ok(Some(genesis)) => genesis,
        Ok(None) => {
            let http = reqwest::Client::new();
            match NaClient::fetch_genesis(&http, &config.na_endpoint).await {
                Ok(genesis) => {
                    let _ = state::store_genesis(&config, &genesis);
                    genesis
                }
                Err(e) => {
                    error!(error = %e, "cannot obtain genesis block");
                    return EXIT_TRUST;
                }
            }
        }
        Err(e) => {
            error!(error = %e, "cannot read persisted genesis block");
            return EXIT_TRUST;
        }
    };

    let trust = match TrustChain::import(genesis, now) {
        Ok(trust) => trust,
        Err(e) => {
            error!(error = %e, "genesis block rejected");
            return EXIT_TRUST;
        }
    };
    info!(
        network = %trust.genesis().network_name,
        version = %trust.genesis().network_version,
        "trust chain verified"
    );

    // Audit chain: a broken chain refuses to run.
    let audit_path = config.audit_path();
    if audit_path.exists() {
        match AuditLog::verify_chain(&audit_path) {
            Ok(events) => info!(events, "audit chain verified"),
            Err(AuditError::ChainBroken { index }) => {
                error!(index, "audit chain broken; refusing to run");
                return EXIT_FATAL;
            }
            Err(e) => {
                error!(error = %e, "audit log unreadable");
                return EXIT_FATAL;
            }
        }
    }
    let audit_log = match AuditLog::open(&audit_path) {
        Ok(log) => log,
        Err(e) => {
            error!(error = %e, "cannot open audit log");
            return EXIT_FATAL;
        }
    };
    let (audit, audit_task) = spawn_audit_writer(audit_log);

    // Join certificate: reuse a valid persisted one, otherwise join.
    let na = Arc::new(NaClient::new(
        &config.na_endpoint,
        keypair.clone(),
        trust.clone(),
    ));
    let cert = match state::load_certificate(&config) {
        Ok(Some(cert)) if trust.verify_certificate(&cert, now, None).is_ok() => cert,
        _ => {
            let roles = vec![config.role.clone()];
            match na.join(&roles, config.validity_hours, now).await {
                Ok(cert) => {
                    let _ = state::store_certificate(&config, &cert);
                    audit
                        .record(
                            time::unix_ms(),
                            genesis_mesh_audit::AuditEventKind::CertIssued,
                            Some(keypair.public_key_b64()),
                            Some(cert.cert_id.clone()),
                            serde_json::json!({ "expires_at": cert.expires_at }),
                        )
                        .await;
                    cert
                }
                Err(e) => {
                    error!(error = %e, "join certificate unobtainable");
                    return EXIT_CERT;
                }
            }
        }
    };

    // Warm state: CRL, policy, peer snapshot.
    let crl = match genesis_mesh_control::CrlStore::with_path(&config.crl_path()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open crl store");
            return EXIT_FATAL;
        }
    };
    let policy = match state::PolicyStore::open(&config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot open policy store");
            return EXIT_FATAL;
        }
    };
    let peer_snapshot = state::load_peer_snapshot(&config).unwrap_or_default();

    // Certificate manager.
    let (cert_events_tx, cert_events_rx) = mpsc::channel(16);
    let (cert_manager, cert_rx) = CertManager::new(
        NaRenewer { inner: na.clone() },
        RenewalSchedule::new(config.renewal_ratio),
        cert,
        cert_events_tx,
    );

    let (node, events_rx, shutdown_tx) = MeshNode::new(NodeSeed {
        config,
        keypair,
        trust,
        audit,
        cert_rx,
        crl,
        policy,
        peer_snapshot,
        delivery_tx: None,
    });

    let cert_shutdown = shutdown_tx.subscribe();
    let cert_task = tokio::spawn(cert_manager.run(cert_shutdown));

    // Best-effort warm start for the CRL; gossip keeps it fresh after.
    if let Ok(crl) = na.fetch_crl().await {
        node.adopt_crl(crl).await;
    }

    // Ctrl-C triggers a graceful drain.
    {
        let node = node.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                node.request_shutdown();
            }
        });
    }

    let exit = match node.run(events_rx, cert_events_rx).await {
        Ok(NodeExit::Clean) => EXIT_OK,
        Ok(NodeExit::CertificateExpired) => EXIT_CERT,
        Err(e) => {
            error!(error = %e, "node runtime failed");
            EXIT_FATAL
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), cert_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), audit_task).await;
    exit
}

/// Adapter handing renewal to the NA client behind an `Arc`.
struct NaRenewer {
    inner: Arc<NaClient>,
}

#[async_trait::async_trait]
impl genesis_mesh_control::CertificateRenewer for NaRenewer {
    async fn renew(
        &self,
        current: &genesis_mesh_domain::JoinCertificate,
    ) -> Result<genesis_mesh_domain::JoinCertificate, genesis_mesh_control::RenewalError> {
        genesis_mesh_control::CertificateRenewer::renew(self.inner.as_ref(), current).await
    }
}
