//! End-to-end scenarios over real sockets: handshake and certificate
//! gating, multi-hop route convergence, and revocation propagation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use genesis_mesh_audit::{spawn_audit_writer, AuditLog};
use genesis_mesh_control::CrlStore;
use genesis_mesh_core::NodeConfig;
use genesis_mesh_crypto::{keys, sign_object, KeyPair};
use genesis_mesh_domain::{
    Crl, GenesisBlock, JoinCertificate, NetworkAuthority, PolicyManifestRef, Revocation,
    TrustChain,
};
use mesh_node::node::{MeshNode, NodeSeed};
use mesh_node::state::PolicyStore;

struct Authority {
    na: KeyPair,
    na_key_id: String,
    trust: TrustChain,
}

fn authority() -> Authority {
    let root = KeyPair::from_seed(&[101u8; 32]);
    let na = KeyPair::from_seed(&[102u8; 32]);
    let na_key_id = keys::key_id_for_b64(&na.public_key_b64()).unwrap();

    let mut genesis = GenesisBlock {
        network_name: "mesh-e2e".to_string(),
        network_version: "1".to_string(),
        root_public_key: root.public_key_b64(),
        network_authority: NetworkAuthority {
            public_key: na.public_key_b64(),
            valid_from: 0,
            valid_to: u64::MAX,
        },
        allowed_crypto_suites: vec!["ed25519".to_string()],
        allowed_transports: vec!["tcp".to_string()],
        policy_manifest: PolicyManifestRef {
            hash: "blake3:test".to_string(),
            url: None,
        },
        bootstrap_anchors: vec![],
        signatures: vec![],
    };
    let sig = sign_object(&genesis, root.signing_key(), root.key_id()).unwrap();
    genesis.signatures.push(sig);

    let trust = TrustChain::import(genesis, genesis_mesh_core::time::unix_ms()).unwrap();
    Authority {
        na,
        na_key_id,
        trust,
    }
}

fn issue_cert(authority: &Authority, subject: &KeyPair, roles: &[&str]) -> JoinCertificate {
    let now = genesis_mesh_core::time::unix_ms();
    let mut cert = JoinCertificate {
        cert_id: format!("cert-{}", subject.key_id()),
        node_public_key: subject.public_key_b64(),
        network_name: "mesh-e2e".to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        scopes: vec![],
        issued_at: now.saturating_sub(10_000),
        expires_at: now + 3_600_000,
        serial: 1,
        issued_by: authority.na_key_id.clone(),
        signatures: vec![],
    };
    let sig = sign_object(&cert, authority.na.signing_key(), &authority.na_key_id).unwrap();
    cert.signatures.push(sig);
    cert
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct TestNode {
    node: Arc<MeshNode>,
    node_id: String,
    endpoint: String,
    _cert_tx: watch::Sender<JoinCertificate>,
    _cert_events_tx: mpsc::Sender<genesis_mesh_control::CertEvent>,
    _dir: tempfile::TempDir,
    _run: tokio::task::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

async fn start_node(authority: &Authority, seed_byte: u8, bootstrap: Vec<String>) -> TestNode {
    start_node_with(authority, seed_byte, bootstrap, |_| {}).await
}

async fn start_node_with<F>(
    authority: &Authority,
    seed_byte: u8,
    bootstrap: Vec<String>,
    tweak: F,
) -> TestNode
where
    F: FnOnce(&mut NodeConfig),
{
    let keypair = Arc::new(KeyPair::from_seed(&[seed_byte; 32]));
    let node_id = keypair.public_key_b64();
    let cert = issue_cert(authority, &keypair, &["role:client"]);

    let port = free_port();
    let endpoint = format!("127.0.0.1:{}", port);
    let dir = tempfile::tempdir().unwrap();

    let mut config = NodeConfig {
        listen_address: endpoint.clone(),
        bootstrap_endpoints: bootstrap,
        data_dir: dir.path().to_path_buf(),
        route_announce_interval_s: 1,
        discovery_interval_s: 1,
        crl_announce_interval_s: 1,
        ..NodeConfig::default()
    };
    tweak(&mut config);

    let audit_log = AuditLog::open(&config.audit_path()).unwrap();
    let (audit, _audit_task) = spawn_audit_writer(audit_log);

    let (cert_tx, cert_rx) = watch::channel(cert);
    let (cert_events_tx, cert_events_rx) = mpsc::channel(4);

    let (node, events_rx, shutdown) = MeshNode::new(NodeSeed {
        config,
        keypair,
        trust: authority.trust.clone(),
        audit,
        cert_rx,
        crl: CrlStore::new(),
        policy: PolicyStore::in_memory(),
        peer_snapshot: vec![],
        delivery_tx: None,
    });

    let run = {
        let node = node.clone();
        tokio::spawn(async move {
            let _ = node.run(events_rx, cert_events_rx).await;
        })
    };

    TestNode {
        node,
        node_id,
        endpoint,
        _cert_tx: cert_tx,
        _cert_events_tx: cert_events_tx,
        _dir: dir,
        _run: run,
        shutdown,
    }
}

async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_establish_with_verified_certificates() {
    let authority = authority();
    let anchor = start_node(&authority, 1, vec![]).await;
    let joiner = start_node(&authority, 2, vec![anchor.endpoint.clone()]).await;

    wait_until("mutual establishment", Duration::from_secs(10), || async {
        let a = anchor.node.connected_peers().await;
        let b = joiner.node.connected_peers().await;
        a.contains(&joiner.node_id) && b.contains(&anchor.node_id)
    })
    .await;

    // Direct routes appear as soon as the neighbor registers.
    wait_until("direct route", Duration::from_secs(5), || async {
        joiner.node.next_hop(&anchor.node_id).await == Some(anchor.node_id.clone())
    })
    .await;

    let _ = anchor.shutdown.send(true);
    let _ = joiner.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_converges_to_multi_hop_routes() {
    let authority = authority();
    let hub = start_node(&authority, 11, vec![]).await;
    // One connection each: the spokes can only ever talk to the hub, so
    // reaching the other spoke requires a learned multi-hop route.
    let left = start_node_with(&authority, 12, vec![hub.endpoint.clone()], |c| {
        c.max_connections = 1;
    })
    .await;
    let right = start_node_with(&authority, 13, vec![hub.endpoint.clone()], |c| {
        c.max_connections = 1;
    })
    .await;

    // After a couple of announcement rounds each spoke reaches the
    // other through the hub.
    wait_until("multi-hop convergence", Duration::from_secs(15), || async {
        left.node.next_hop(&right.node_id).await == Some(hub.node_id.clone())
            && right.node.next_hop(&left.node_id).await == Some(hub.node_id.clone())
    })
    .await;

    let _ = hub.shutdown.send(true);
    let _ = left.shutdown.send(true);
    let _ = right.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn revocation_propagates_and_drops_connections() {
    let authority = authority();
    let hub = start_node(&authority, 21, vec![]).await;
    let victim = start_node(&authority, 22, vec![hub.endpoint.clone()]).await;
    let observer = start_node(&authority, 23, vec![hub.endpoint.clone()]).await;

    wait_until("mesh built", Duration::from_secs(10), || async {
        hub.node.connected_peers().await.len() == 2
    })
    .await;

    // The authority revokes the victim; the CRL is injected at the
    // observer only and must reach the hub by gossip.
    let now = genesis_mesh_core::time::unix_ms();
    let mut crl = Crl {
        crl_id: "crl-e2e-1".to_string(),
        sequence: 1,
        issued_at: now,
        next_update: now + 3_600_000,
        issuer: authority.na_key_id.clone(),
        revocations: vec![Revocation {
            certificate_id: format!("cert-{}", KeyPair::from_seed(&[22u8; 32]).key_id()),
            subject_public_key: victim.node_id.clone(),
            revoked_at: now,
            reason: "key compromise".to_string(),
            issuer: authority.na_key_id.clone(),
        }],
        signatures: vec![],
    };
    let sig = sign_object(&crl, authority.na.signing_key(), &authority.na_key_id).unwrap();
    crl.signatures.push(sig);

    observer.node.adopt_crl(crl).await;
    assert_eq!(observer.node.crl_sequence().await, 1);

    wait_until("crl reaches hub", Duration::from_secs(10), || async {
        hub.node.crl_sequence().await == 1
    })
    .await;

    wait_until("victim dropped", Duration::from_secs(10), || async {
        !hub.node.connected_peers().await.contains(&victim.node_id)
    })
    .await;

    // A revoked certificate cannot re-establish.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!hub.node.connected_peers().await.contains(&victim.node_id));

    let _ = hub.shutdown.send(true);
    let _ = victim.shutdown.send(true);
    let _ = observer.shutdown.send(true);
}
