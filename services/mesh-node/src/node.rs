//! Node runtime: owns every subsystem and wires the data flow between
//! them.
//!
//! One dispatcher task demultiplexes inbound frames by kind into the
//! routing, discovery, CRL, and control paths; timer tasks drive the
//! periodic protocols. Lock order is peer manager before routing table;
//! the audit log is reached only through its single-writer channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use genesis_mesh_audit::{AuditEventKind, AuditHandle};
use genesis_mesh_control::{
    CertEvent, ControlAction, ControlHandler, CrlGossipAction, CrlStore, RbacPolicy,
};
use genesis_mesh_core::{time, ErrorKind, NodeConfig, NodeId};
use genesis_mesh_crypto::KeyPair;
use genesis_mesh_domain::{JoinCertificate, TrustChain};
use genesis_mesh_mesh::{
    Announcer, Discovery, ForwardDecision, GoodBehavior, Misbehavior, PeerManager,
    PeerManagerConfig, Router, RoutingTable, RoutingTableConfig,
};
use genesis_mesh_transport::{
    CloseReason, Connection, ConnectionConfig, ConnectionEvent, ConnectionPool, ConnectionState,
    DataPayload, HandshakeAckPayload, HandshakePayload, Message, SessionKey, PROTOCOL_VERSION,
};

use crate::metrics::Metrics;
use crate::state::{self, PolicyStore};

/// Exit disposition reported by [`MeshNode::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// Clean shutdown
    Clean,
    /// Certificate expired and could not be renewed
    CertificateExpired,
}

/// A datagram delivered to this node.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Originating node
    pub source: NodeId,
    /// Decoded application bytes
    pub data: Vec<u8>,
}

/// The mesh node runtime.
pub struct MeshNode {
    config: NodeConfig,
    node_id: NodeId,
    keypair: Arc<KeyPair>,
    trust: TrustChain,
    metrics: Arc<Metrics>,
    audit: AuditHandle,

    pool: Arc<ConnectionPool>,
    peers: Mutex<PeerManager>,
    table: Mutex<RoutingTable>,
    router: Mutex<Router>,
    announcer: Announcer,
    discovery: Discovery,
    crl: Mutex<CrlStore>,
    control: Mutex<ControlHandler>,
    policy: Mutex<PolicyStore>,

    cert_rx: watch::Receiver<JoinCertificate>,
    renewal_failures: AtomicU32,
    anchors: Mutex<Vec<String>>,
    pending_nonces: Mutex<HashMap<u64, String>>,
    conn_config: ConnectionConfig,

    events_tx: mpsc::Sender<ConnectionEvent>,
    shutdown_tx: watch::Sender<bool>,
    delivery_tx: Option<mpsc::Sender<Delivery>>,
}

/// Everything `MeshNode::new` needs from the bootstrap phase.
pub struct NodeSeed {
    /// Validated configuration
    pub config: NodeConfig,
    /// Node identity key
    pub keypair: Arc<KeyPair>,
    /// Verified trust chain
    pub trust: TrustChain,
    /// Audit writer handle
    pub audit: AuditHandle,
    /// Live certificate watch from the certificate manager
    pub cert_rx: watch::Receiver<JoinCertificate>,
    /// CRL store (possibly warm from disk)
    pub crl: CrlStore,
    /// Policy store (possibly warm from disk)
    pub policy: PolicyStore,
    /// Peer snapshot for a warm start
    pub peer_snapshot: Vec<genesis_mesh_mesh::PeerRecord>,
    /// Optional sink for datagrams addressed to this node
    pub delivery_tx: Option<mpsc::Sender<Delivery>>,
}

impl MeshNode {
    /// Assemble the node runtime. Returns the node, the connection event
    /// channel receiver it must be run with, and the shutdown trigger.
    pub fn new(seed: NodeSeed) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>, watch::Sender<bool>) {
        let config = seed.config;
        let node_id = seed.keypair.public_key_b64();

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        let peer_config = PeerManagerConfig {
            blacklist_threshold: config.reputation_blacklist_threshold,
            stale_timeout_ms: time::secs_to_ms(config.stale_peer_timeout_s),
            gossip_cap: config.peer_gossip_cap,
            ..PeerManagerConfig::default()
        };
        let mut peers = PeerManager::new(node_id.clone(), peer_config);
        peers.restore(seed.peer_snapshot);

        let table_config = RoutingTableConfig {
            max_hops: seed.policy.max_hops(config.max_hops),
            stale_timeout_ms: time::secs_to_ms(config.route_stale_timeout_s),
            ..RoutingTableConfig::default()
        };

        let conn_config = ConnectionConfig {
            handshake_timeout: Duration::from_secs(config.handshake_timeout_s),
            idle_timeout: Duration::from_secs(config.idle_timeout_s),
            ping_interval: Duration::from_secs(config.ping_interval_s),
            ping_timeout: Duration::from_secs(config.ping_interval_s * 4),
            send_queue_capacity: config.send_queue_capacity,
            drain_timeout: Duration::from_secs(5),
        };

        let genesis_anchors: Vec<String> = seed
            .trust
            .genesis()
            .bootstrap_anchors
            .iter()
            .map(|anchor| anchor.endpoint.clone())
            .collect();
        let mut bootstrap = genesis_anchors.clone();
        bootstrap.extend(config.bootstrap_endpoints.iter().cloned());

        let max_hops = seed.policy.max_hops(config.max_hops);

        let node = Arc::new(Self {
            node_id: node_id.clone(),
            keypair: seed.keypair,
            trust: seed.trust,
            metrics: Arc::new(Metrics::new()),
            audit: seed.audit,
            pool: Arc::new(ConnectionPool::new(config.max_connections)),
            peers: Mutex::new(peers),
            table: Mutex::new(RoutingTable::new(node_id.clone(), table_config)),
            router: Mutex::new(Router::new(node_id.clone(), max_hops)),
            announcer: Announcer::new(node_id.clone()),
            discovery: Discovery::new(bootstrap.clone(), config.peer_gossip_cap),
            crl: Mutex::new(seed.crl),
            control: Mutex::new(ControlHandler::new(node_id, RbacPolicy::default())),
            policy: Mutex::new(seed.policy),
            cert_rx: seed.cert_rx,
            renewal_failures: AtomicU32::new(0),
            anchors: Mutex::new(bootstrap),
            pending_nonces: Mutex::new(HashMap::new()),
            conn_config,
            events_tx,
            shutdown_tx: shutdown_tx.clone(),
            delivery_tx: seed.delivery_tx,
            config,
        });

        (node, events_rx, shutdown_tx)
    }

    /// Our node id (base64 public key).
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Node identity key.
    pub fn keypair(&self) -> &Arc<KeyPair> {
        &self.keypair
    }

    /// Currently connected peer ids.
    pub async fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.lock().await.connected()
    }

    /// Usable next hop toward `destination`, if the table has one.
    pub async fn next_hop(&self, destination: &NodeId) -> Option<NodeId> {
        self.table
            .lock()
            .await
            .next_hop(destination, time::unix_ms())
            .cloned()
    }

    /// Sequence of the held CRL (0 when none).
    pub async fn crl_sequence(&self) -> u64 {
        self.crl.lock().await.sequence()
    }

    /// Adopt an authority-fetched CRL through the same path as a
    /// gossiped push: verify, install, cut revoked peers, re-flood.
    pub async fn adopt_crl(&self, crl: genesis_mesh_domain::Crl) {
        self.accept_crl(crl, None).await;
    }

    /// Health report assembled from live subsystem state.
    pub async fn health(&self) -> crate::health::HealthReport {
        let now = time::unix_ms();
        let cert = self.cert_rx.borrow().clone();
        let (_, connected, _) = self.peers.lock().await.counts(now);
        let connected_anchors = {
            let peers = self.peers.lock().await;
            peers
                .connected()
                .iter()
                .filter(|id| {
                    peers
                        .get(id)
                        .map(|r| r.observed_roles.iter().any(|role| role == "role:anchor"))
                        .unwrap_or(false)
                })
                .count()
        };
        let (_, active_routes, _) = self.table.lock().await.stats(now);
        let crl = self.crl.lock().await;

        crate::health::evaluate(&crate::health::HealthInputs {
            cert_remaining_ms: cert.expires_at.saturating_sub(now),
            cert_lifetime_ms: cert.expires_at.saturating_sub(cert.issued_at),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            connected_peers: connected,
            connected_anchors,
            active_routes,
            has_crl: crl.current().is_some(),
            crl_stale: crl.current().map(|c| c.is_stale(now)).unwrap_or(false),
        })
    }

    /// Run the node until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<ConnectionEvent>,
        mut cert_events: mpsc::Receiver<CertEvent>,
    ) -> std::io::Result<NodeExit> {
        self.audit_now(
            AuditEventKind::NodeStarted,
            None,
            json!({ "listen": self.config.listen_address }),
        )
        .await;

        let listener = tokio::net::TcpListener::bind(&self.config.listen_address).await?;
        info!(addr = %self.config.listen_address, node = %self.node_id, "mesh node listening");

        self.clone().spawn_accept_loop(listener);
        self.clone().spawn_timers();
        self.clone().bootstrap().await;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut exit = NodeExit::Clean;
        let mut cert_events_open = true;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some(ConnectionEvent::Inbound { conn_id, message }) => {
                            self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.handle_message(conn_id, message).await;
                        }
                        Some(ConnectionEvent::Closed { conn_id, state }) => {
                            self.handle_closed(conn_id, state).await;
                        }
                        None => break,
                    }
                }
                event = cert_events.recv(), if cert_events_open => {
                    match event {
                        Some(CertEvent::Renewed(cert)) => {
                            self.renewal_failures.store(0, Ordering::Relaxed);
                            self.metrics.cert_renewals.fetch_add(1, Ordering::Relaxed);
                            let _ = state::store_certificate(&self.config, &cert);
                            self.audit_now(
                                AuditEventKind::CertRenewed,
                                Some(cert.cert_id.clone()),
                                json!({ "expires_at": cert.expires_at }),
                            )
                            .await;
                        }
                        Some(CertEvent::RenewalFailed { attempt, retry_in_ms }) => {
                            self.renewal_failures.store(attempt, Ordering::Relaxed);
                            self.metrics.cert_renewal_failures.fetch_add(1, Ordering::Relaxed);
                            debug!(attempt, retry_in_ms, "certificate renewal failed");
                        }
                        Some(CertEvent::Expired) => {
                            self.audit_now(AuditEventKind::CertExpired, None, json!({})).await;
                            exit = NodeExit::CertificateExpired;
                            break;
                        }
                        None => cert_events_open = false,
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(exit)
    }

    /// Trigger a graceful shutdown from outside the dispatcher.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn shutdown(&self) {
        info!("draining connections for shutdown");
        self.pool.drain_all("node shutting down");
        tokio::time::sleep(self.conn_config.drain_timeout).await;

        let snapshot = self.peers.lock().await.snapshot();
        let _ = state::store_peer_snapshot(&self.config, &snapshot);

        self.audit_now(AuditEventKind::NodeStopped, None, json!({})).await;
    }

    // ── connection lifecycle ────────────────────────────────────────────

    fn spawn_accept_loop(self: Arc<Self>, listener: tokio::net::TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    accepted = listener.accept() => {
                        let (stream, remote_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        match self.pool.reserve_slot() {
                            Ok(conn_id) => {
                                let conn = Connection::spawn(
                                    stream,
                                    conn_id,
                                    remote_addr,
                                    false,
                                    self.conn_config.clone(),
                                    self.events_tx.clone(),
                                );
                                self.pool.track_pending(conn);
                            }
                            Err(_) => {
                                // Beyond the cap: refuse by dropping the socket.
                                self.metrics.record_error(ErrorKind::PoolFull);
                                debug!(%remote_addr, "pool full, refusing accept");
                            }
                        }
                    }
                }
            }
        });
    }

    async fn bootstrap(self: Arc<Self>) {
        let endpoints: Vec<String> = self.anchors.lock().await.clone();
        info!(anchors = endpoints.len(), "bootstrapping from anchors");
        for endpoint in endpoints {
            self.clone().spawn_dial(endpoint, None);
        }
    }

    fn spawn_dial(self: Arc<Self>, endpoint: String, expected_peer: Option<NodeId>) {
        tokio::spawn(async move {
            if let Some(peer_id) = &expected_peer {
                if !self.pool.begin_dial(peer_id) {
                    return;
                }
            }

            let result = self.dial_and_greet(&endpoint).await;

            if let Some(peer_id) = &expected_peer {
                self.pool.finish_dial(peer_id);
                if result.is_err() {
                    let now = time::unix_ms();
                    self.peers.lock().await.on_dial_failure(peer_id, now);
                }
            }
            if let Err(e) = result {
                self.metrics.connections_failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error(ErrorKind::Io);
                debug!(%endpoint, error = %e, "dial failed");
                self.audit_now(
                    AuditEventKind::ConnFailed,
                    expected_peer,
                    json!({ "endpoint": endpoint, "error": e.to_string() }),
                )
                .await;
            }
        });
    }

    async fn dial_and_greet(&self, endpoint: &str) -> Result<(), anyhow::Error> {
        let addr: std::net::SocketAddr = endpoint.parse()?;
        let conn_id = self.pool.reserve_slot()?;
        let conn =
            Connection::dial(addr, conn_id, self.conn_config.clone(), self.events_tx.clone())
                .await?;
        self.pool.track_pending(conn.clone());

        let mut nonce_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = BASE64.encode(nonce_bytes);
        self.pending_nonces.lock().await.insert(conn_id, nonce.clone());

        let cert = self.cert_rx.borrow().clone();
        conn.send(Message::Handshake(HandshakePayload {
            protocol_version: PROTOCOL_VERSION,
            node_id: self.node_id.clone(),
            certificate: cert.clone(),
            nonce,
            endpoint: self.config.listen_address.clone(),
            roles: cert.roles,
        }))?;
        Ok(())
    }

    async fn handle_closed(&self, conn_id: u64, state: ConnectionState) {
        let peer_id = self.pool.remove(conn_id);
        self.pending_nonces.lock().await.remove(&conn_id);

        let failed = matches!(state, ConnectionState::Failed(_));
        if failed {
            self.metrics.connections_failed.fetch_add(1, Ordering::Relaxed);
        }

        let Some(peer_id) = peer_id else {
            return;
        };

        let now = time::unix_ms();
        self.peers.lock().await.on_disconnected(&peer_id, now);

        // Invalidate everything routed through the lost neighbor and
        // flood the withdrawals.
        let withdrawals = self.table.lock().await.remove_neighbor(&peer_id, now);
        if let Some(message) = self.announcer.build_withdrawal(withdrawals) {
            let sent = self.pool.broadcast(&message, Some(&peer_id));
            self.metrics
                .messages_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
        }

        let kind = if failed {
            AuditEventKind::ConnFailed
        } else {
            AuditEventKind::ConnClosed
        };
        self.audit_now(kind, Some(peer_id.clone()), json!({ "state": state })).await;
        self.audit_now(AuditEventKind::NodeLeft, Some(peer_id), json!({})).await;
    }

    // ── inbound dispatch ────────────────────────────────────────────────

    async fn handle_message(&self, conn_id: u64, message: Message) {
        match message {
            Message::Handshake(payload) => self.handle_handshake(conn_id, payload).await,
            Message::HandshakeAck(payload) => self.handle_handshake_ack(conn_id, payload).await,
            Message::PeerListRequest => self.handle_peer_list_request(conn_id).await,
            Message::PeerListResponse { peers } => {
                self.handle_peer_list_response(conn_id, peers).await
            }
            Message::RouteAnnounce { routes } => self.handle_route_announce(conn_id, routes).await,
            Message::RouteWithdraw { withdrawals } => {
                self.handle_route_withdraw(conn_id, withdrawals).await
            }
            Message::Data(payload) | Message::DataForward(payload) => {
                self.handle_data(conn_id, payload).await
            }
            Message::Control(control) => self.handle_control(conn_id, *control).await,
            Message::CrlAnnounce { sequence } => self.handle_crl_announce(conn_id, sequence).await,
            Message::CrlRequest { since } => self.handle_crl_request(conn_id, since).await,
            Message::CrlPush(crl) => self.handle_crl_push(conn_id, *crl).await,
            Message::Disconnect { reason } => {
                debug!(conn_id, %reason, "peer disconnecting");
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Answered inside the connection's read loop.
            }
        }
    }

    fn peer_of(&self, conn_id: u64) -> Option<(Arc<Connection>, NodeId)> {
        let conn = self.pool.get_by_conn_id(conn_id)?;
        let peer_id = conn.peer_id()?.clone();
        Some((conn, peer_id))
    }

    // ── handshake ───────────────────────────────────────────────────────

    async fn handle_handshake(&self, conn_id: u64, payload: HandshakePayload) {
        let Some(conn) = self.pool.get_by_conn_id(conn_id) else {
            return;
        };
        let now = time::unix_ms();

        if let Err(kind) = self.verify_peer_identity(&payload.node_id, &payload.certificate, now).await {
            self.reject_handshake(&conn, &payload.node_id, kind).await;
            return;
        }

        // Responder: derive the session from (initiator, responder) nonces.
        let mut nonce_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let our_nonce = BASE64.encode(nonce_bytes);
        let session = SessionKey::derive(payload.nonce.as_bytes(), our_nonce.as_bytes());

        if !conn.mark_established(payload.node_id.clone(), session) {
            conn.fail(CloseReason::AuthFailed);
            return;
        }
        if self.pool.promote(conn_id, &payload.node_id).is_err() {
            debug!(peer = %payload.node_id, "duplicate connection, dropping");
            conn.fail(CloseReason::LocalClose);
            return;
        }

        let cert = self.cert_rx.borrow().clone();
        let ack = Message::HandshakeAck(HandshakeAckPayload {
            node_id: self.node_id.clone(),
            certificate: cert,
            nonce_echo: payload.nonce,
            nonce: our_nonce,
            endpoint: self.config.listen_address.clone(),
        });
        if conn.send(ack).is_err() {
            conn.fail(CloseReason::Io);
            return;
        }

        self.finish_establish(
            &conn,
            &payload.node_id,
            &payload.certificate.roles,
            &payload.endpoint,
            now,
        )
        .await;
    }

    async fn handle_handshake_ack(&self, conn_id: u64, payload: HandshakeAckPayload) {
        let Some(conn) = self.pool.get_by_conn_id(conn_id) else {
            return;
        };
        let now = time::unix_ms();

        let our_nonce = self.pending_nonces.lock().await.remove(&conn_id);
        let Some(our_nonce) = our_nonce else {
            // An ack we never asked for.
            conn.fail(CloseReason::AuthFailed);
            return;
        };
        if payload.nonce_echo != our_nonce {
            self.reject_handshake(&conn, &payload.node_id, ErrorKind::BadSignature)
                .await;
            return;
        }

        if let Err(kind) = self.verify_peer_identity(&payload.node_id, &payload.certificate, now).await {
            self.reject_handshake(&conn, &payload.node_id, kind).await;
            return;
        }

        // Initiator: same derivation order as the responder.
        let session = SessionKey::derive(our_nonce.as_bytes(), payload.nonce.as_bytes());
        if !conn.mark_established(payload.node_id.clone(), session) {
            conn.fail(CloseReason::AuthFailed);
            return;
        }
        if self.pool.promote(conn_id, &payload.node_id).is_err() {
            conn.fail(CloseReason::LocalClose);
            return;
        }

        self.finish_establish(
            &conn,
            &payload.node_id,
            &payload.certificate.roles,
            &payload.endpoint,
            now,
        )
        .await;
    }

    /// The certificate checks gating `Established`: signed by the
    /// current authority, inside its window, not revoked, bound to the
    /// claimed node id, and the peer not blacklisted.
    async fn verify_peer_identity(
        &self,
        node_id: &NodeId,
        certificate: &JoinCertificate,
        now: u64,
    ) -> Result<(), ErrorKind> {
        if *node_id != certificate.node_public_key {
            return Err(ErrorKind::BadSignature);
        }
        if self.peers.lock().await.is_blacklisted(node_id, now) {
            return Err(ErrorKind::PeerBlacklisted);
        }

        let crl = self.crl.lock().await;
        self.trust
            .verify_certificate(certificate, now, crl.current())
            .map_err(|e| {
                use genesis_mesh_domain::TrustError;
                match e {
                    TrustError::ExpiredCert { .. } => ErrorKind::ExpiredCert,
                    TrustError::RevokedCert { .. } => ErrorKind::RevokedCert,
                    TrustError::UnknownIssuer(_) => ErrorKind::UnknownIssuer,
                    _ => ErrorKind::BadSignature,
                }
            })
    }

    async fn reject_handshake(&self, conn: &Arc<Connection>, claimed: &NodeId, kind: ErrorKind) {
        self.metrics.record_error(kind);
        let now = time::unix_ms();
        if kind == ErrorKind::BadSignature {
            self.audit_now(
                AuditEventKind::SignatureInvalid,
                Some(claimed.clone()),
                json!({}),
            )
            .await;
        }
        self.audit_now(
            AuditEventKind::AuthFailure,
            Some(claimed.clone()),
            json!({ "reason": kind.as_str() }),
        )
        .await;
        self.peers
            .lock()
            .await
            .record_misbehavior(claimed, Misbehavior::BadSignature, now);
        // Generic rejection only; the specific reason stays local.
        conn.fail(CloseReason::AuthFailed);
    }

    async fn finish_establish(
        &self,
        conn: &Arc<Connection>,
        peer_id: &NodeId,
        roles: &[String],
        endpoint: &str,
        now: u64,
    ) {
        self.peers
            .lock()
            .await
            .on_connected(peer_id, endpoint, roles, now);
        self.table.lock().await.add_neighbor(peer_id, now);
        self.metrics
            .connections_established
            .fetch_add(1, Ordering::Relaxed);

        self.audit_now(AuditEventKind::AuthSuccess, Some(peer_id.clone()), json!({})).await;
        self.audit_now(
            AuditEventKind::ConnEstablished,
            Some(peer_id.clone()),
            json!({
                "endpoint": endpoint,
                "remote_addr": conn.remote_addr.to_string(),
                "outbound": conn.outbound,
            }),
        )
        .await;
        self.audit_now(AuditEventKind::NodeJoined, Some(peer_id.clone()), json!({})).await;
        info!(peer = %peer_id, endpoint, "peer established");
    }

    // ── discovery ───────────────────────────────────────────────────────

    async fn handle_peer_list_request(&self, conn_id: u64) {
        let Some((conn, _)) = self.peer_of(conn_id) else {
            return;
        };
        let now = time::unix_ms();
        let response = {
            let peers = self.peers.lock().await;
            self.discovery.build_response(&peers, now)
        };
        if conn.send(response).is_ok() {
            self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn handle_peer_list_response(
        &self,
        conn_id: u64,
        entries: Vec<genesis_mesh_transport::PeerEntry>,
    ) {
        let Some((_, peer_id)) = self.peer_of(conn_id) else {
            return;
        };
        let now = time::unix_ms();
        let added = {
            let mut peers = self.peers.lock().await;
            self.discovery.handle_response(&mut peers, &peer_id, &entries, now)
        };
        self.metrics
            .peers_discovered
            .fetch_add(added as u64, Ordering::Relaxed);
    }

    // ── routing ─────────────────────────────────────────────────────────

    async fn handle_route_announce(
        &self,
        conn_id: u64,
        routes: Vec<genesis_mesh_transport::RouteAdvert>,
    ) {
        let Some((_, peer_id)) = self.peer_of(conn_id) else {
            return;
        };
        let now = time::unix_ms();
        let outcome = {
            let mut table = self.table.lock().await;
            self.announcer.handle_announce(&mut table, &peer_id, &routes, now)
        };
        self.metrics
            .routes_updated
            .fetch_add((outcome.installed + outcome.updated) as u64, Ordering::Relaxed);

        let mut peers = self.peers.lock().await;
        if outcome.changed() {
            peers.record_success(&peer_id, GoodBehavior::ValidRoute, now);
        } else if outcome.rejected > 0 && !routes.is_empty() {
            // Every advert lost: either stale flooding or rule abuse.
            let blacklisted = peers.record_misbehavior(&peer_id, Misbehavior::InvalidRoute, now);
            drop(peers);
            if let Some(until) = blacklisted {
                self.on_peer_blacklisted(&peer_id, "invalid_route", until).await;
            }
        }
    }

    async fn handle_route_withdraw(
        &self,
        conn_id: u64,
        withdrawals: Vec<genesis_mesh_transport::RouteWithdrawal>,
    ) {
        let Some((_, peer_id)) = self.peer_of(conn_id) else {
            return;
        };
        let now = time::unix_ms();
        let to_flood = {
            let mut table = self.table.lock().await;
            self.announcer
                .handle_withdrawals(&mut table, &peer_id, &withdrawals, now)
        };
        if let Some(message) = self.announcer.build_withdrawal(to_flood) {
            let sent = self.pool.broadcast(&message, Some(&peer_id));
            self.metrics
                .messages_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
    }

    async fn handle_data(&self, conn_id: u64, mut payload: DataPayload) {
        let Some((_, peer_id)) = self.peer_of(conn_id) else {
            return;
        };
        let now = time::unix_ms();

        let decision = {
            let table = self.table.lock().await;
            let mut router = self.router.lock().await;
            router.route(&table, &mut payload, now)
        };

        match decision {
            ForwardDecision::Deliver => {
                let data = BASE64.decode(&payload.data).unwrap_or_default();
                debug!(source = %payload.source, bytes = data.len(), "datagram delivered");
                if let Some(tx) = &self.delivery_tx {
                    let _ = tx
                        .send(Delivery {
                            source: payload.source.clone(),
                            data,
                        })
                        .await;
                }
            }
            ForwardDecision::Forward { next_hop } => {
                if self.pool.send_to(&next_hop, Message::DataForward(payload)).is_ok() {
                    self.metrics.messages_forwarded.fetch_add(1, Ordering::Relaxed);
                    self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            ForwardDecision::Flood => {
                let sent = self
                    .pool
                    .broadcast(&Message::DataForward(payload), Some(&peer_id));
                self.metrics.messages_forwarded.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .messages_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            ForwardDecision::Drop(reason) => {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                use genesis_mesh_mesh::DropReason;
                let kind = match reason {
                    DropReason::TtlExpired => ErrorKind::TtlExpired,
                    DropReason::NoRoute => ErrorKind::NoRoute,
                    DropReason::Duplicate => return,
                };
                self.metrics.record_error(kind);
                if kind == ErrorKind::TtlExpired {
                    let now = time::unix_ms();
                    self.peers
                        .lock()
                        .await
                        .record_misbehavior(&peer_id, Misbehavior::TtlAbuse, now);
                }
            }
        }
    }

    // ── control plane ───────────────────────────────────────────────────

    async fn handle_control(&self, conn_id: u64, message: genesis_mesh_domain::ControlMessage) {
        let Some((conn, peer_id)) = self.peer_of(conn_id) else {
            return;
        };
        let now = time::unix_ms();

        self.audit_now(
            AuditEventKind::ControlReceived,
            Some(message.message_id.clone()),
            json!({ "command": message.command.as_str(), "from": peer_id }),
        )
        .await;

        let verdict = {
            let crl = self.crl.lock().await;
            let mut control = self.control.lock().await;
            control.handle(&message, &self.trust, crl.current(), now)
        };

        match verdict {
            Ok(Some(action)) => {
                self.metrics.control_accepted.fetch_add(1, Ordering::Relaxed);
                self.audit_now(
                    AuditEventKind::ControlAccepted,
                    Some(message.message_id.clone()),
                    json!({ "command": message.command.as_str() }),
                )
                .await;
                self.execute_control_action(action, &message).await;
            }
            Ok(None) => {
                debug!(message_id = %message.message_id, "control message for another node");
            }
            Err(reason) => {
                let kind = reason.error_kind();
                self.metrics.control_rejected.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_error(kind);
                self.audit_now(
                    AuditEventKind::ControlRejected,
                    Some(message.message_id.clone()),
                    json!({ "command": message.command.as_str(), "reason": kind.as_str() }),
                )
                .await;
                if kind.is_security_relevant() {
                    let blacklisted = self.peers.lock().await.record_misbehavior(
                        &peer_id,
                        Misbehavior::BadSignature,
                        now,
                    );
                    if let Some(until) = blacklisted {
                        self.on_peer_blacklisted(&peer_id, kind.as_str(), until).await;
                    }
                }
                // The sender only learns that the message was refused.
                let _ = conn.send(Message::Disconnect {
                    reason: "control message rejected".to_string(),
                });
            }
        }
    }

    async fn execute_control_action(
        &self,
        action: ControlAction,
        message: &genesis_mesh_domain::ControlMessage,
    ) {
        match action {
            ControlAction::ApplyPolicy(value) => {
                let manifest = match state::policy_from_value(value) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        warn!(error = %e, "policy payload unparseable");
                        return;
                    }
                };
                if let Err(e) = self.trust.verify_policy(&manifest) {
                    warn!(error = %e, "policy manifest failed verification");
                    self.metrics.record_error(ErrorKind::BadSignature);
                    return;
                }
                let changed = {
                    let mut policy = self.policy.lock().await;
                    policy.apply(manifest.clone()).unwrap_or(false)
                };
                if changed {
                    let max_hops = manifest.routing.max_hops;
                    self.table.lock().await.set_max_hops(max_hops);
                    self.router.lock().await.set_max_hops(max_hops);
                    self.audit_now(
                        AuditEventKind::PolicyApplied,
                        Some(manifest.policy_id.clone()),
                        json!({ "issuer": message.issuer }),
                    )
                    .await;
                }
            }
            ControlAction::RevokeCertificate {
                certificate_id,
                subject_public_key,
                reason,
            } => {
                self.audit_now(
                    AuditEventKind::CertRevoked,
                    Some(certificate_id),
                    json!({ "reason": reason }),
                )
                .await;
                // The durable revocation arrives as an NA-signed CRL;
                // locally we cut the subject off right away.
                self.disconnect_subject(&subject_public_key, &reason).await;
            }
            ControlAction::RevokeNode { node_id, reason } => {
                self.disconnect_subject(&node_id, &reason).await;
            }
            ControlAction::UpdateBootstrap { anchors } => {
                info!(count = anchors.len(), "bootstrap anchors updated");
                *self.anchors.lock().await = anchors;
            }
            ControlAction::Shutdown { reason } => {
                warn!(%reason, "shutdown commanded");
                self.request_shutdown();
            }
            ControlAction::RelayCrlPush => {
                // The CRL itself travels as a CrlPush frame and is
                // verified there; nothing to do for the envelope.
            }
        }
    }

    async fn disconnect_subject(&self, node_id: &NodeId, reason: &str) {
        let now = time::unix_ms();
        let until = now + 3_600_000;
        self.peers.lock().await.force_blacklist(node_id, until, now);
        if let Some(conn) = self.pool.get(node_id) {
            conn.fail(CloseReason::Revoked);
        }
        self.on_peer_blacklisted(node_id, reason, until).await;
    }

    async fn on_peer_blacklisted(&self, node_id: &NodeId, reason: &str, until: u64) {
        self.metrics.peers_blacklisted.fetch_add(1, Ordering::Relaxed);
        self.audit_now(
            AuditEventKind::NodeBlacklisted,
            Some(node_id.clone()),
            json!({ "reason": reason, "until": until }),
        )
        .await;
    }

    // ── CRL gossip ──────────────────────────────────────────────────────

    async fn handle_crl_announce(&self, conn_id: u64, sequence: u64) {
        let Some((conn, _)) = self.peer_of(conn_id) else {
            return;
        };
        let action = self.crl.lock().await.handle_announce(sequence);
        if let CrlGossipAction::Reply(message) = action {
            let _ = conn.send(message);
        }
    }

    async fn handle_crl_request(&self, conn_id: u64, since: u64) {
        let Some((conn, _)) = self.peer_of(conn_id) else {
            return;
        };
        let action = self.crl.lock().await.handle_request(since);
        if let CrlGossipAction::Reply(message) = action {
            let _ = conn.send(message);
        }
    }

    async fn handle_crl_push(&self, conn_id: u64, crl: genesis_mesh_domain::Crl) {
        let Some((_, peer_id)) = self.peer_of(conn_id) else {
            return;
        };
        self.accept_crl(crl, Some(&peer_id)).await;
    }

    async fn accept_crl(&self, crl: genesis_mesh_domain::Crl, from: Option<&NodeId>) {
        let sequence = crl.sequence;
        let pushed = crl.clone();

        let result = self.crl.lock().await.handle_push(crl, &self.trust);
        match result {
            Ok(CrlGossipAction::Accepted(update)) => {
                self.metrics.record_crl_sequence(update.sequence);
                self.audit_now(
                    AuditEventKind::CrlUpdated,
                    None,
                    json!({
                        "sequence": update.sequence,
                        "newly_revoked": update.newly_revoked_subjects.len(),
                    }),
                )
                .await;

                // Cut off every connection whose subject the new CRL
                // revokes.
                for subject in &update.newly_revoked_subjects {
                    if let Some(conn) = self.pool.get(subject) {
                        conn.fail(CloseReason::Revoked);
                    }
                    let now = time::unix_ms();
                    self.peers
                        .lock()
                        .await
                        .force_blacklist(subject, now + 3_600_000, now);
                    self.metrics.peers_blacklisted.fetch_add(1, Ordering::Relaxed);
                    self.audit_now(
                        AuditEventKind::NodeBlacklisted,
                        Some(subject.clone()),
                        json!({ "reason": "revoked", "sequence": update.sequence }),
                    )
                    .await;
                }

                // Re-flood so revocation reaches the whole mesh fast.
                let sent = self
                    .pool
                    .broadcast(&Message::CrlPush(Box::new(pushed)), from);
                self.metrics
                    .messages_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                self.metrics.record_error(ErrorKind::BadSignature);
                self.audit_now(
                    AuditEventKind::CrlInvalidSignature,
                    from.cloned(),
                    json!({ "sequence": sequence, "error": e.to_string() }),
                )
                .await;
                if let Some(peer_id) = from {
                    let now = time::unix_ms();
                    self.peers
                        .lock()
                        .await
                        .record_misbehavior(peer_id, Misbehavior::BadSignature, now);
                }
            }
        }
    }

    // ── timers ──────────────────────────────────────────────────────────

    fn spawn_timers(self: Arc<Self>) {
        self.clone().spawn_interval_task(
            Duration::from_secs(self.config.discovery_interval_s),
            |node| async move { node.discovery_tick().await },
        );
        self.clone().spawn_interval_task(
            Duration::from_secs(self.config.route_announce_interval_s),
            |node| async move { node.announce_tick().await },
        );
        self.clone().spawn_interval_task(
            Duration::from_secs(self.config.route_announce_interval_s.max(10)),
            |node| async move { node.sweep_tick().await },
        );
        self.clone().spawn_interval_task(
            Duration::from_secs(self.config.crl_announce_interval_s),
            |node| async move { node.crl_tick().await },
        );
        self.clone().spawn_interval_task(
            Duration::from_secs(self.config.stale_peer_timeout_s.max(60) / 3),
            |node| async move { node.peer_cleanup_tick().await },
        );
    }

    fn spawn_interval_task<F, Fut>(self: Arc<Self>, period: Duration, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = ticker.tick() => tick(self.clone()).await,
                }
            }
        });
    }

    async fn discovery_tick(self: Arc<Self>) {
        let request = self.discovery.build_request();
        let sent = self.pool.broadcast(&request, None);
        self.metrics
            .messages_sent
            .fetch_add(sent as u64, Ordering::Relaxed);

        // Fold connection-level liveness back into peer records: each
        // answered ping is a successful interaction and its RTT feeds
        // the peer's latency.
        {
            let now = time::unix_ms();
            let mut peers = self.peers.lock().await;
            for peer_id in self.pool.connected_peers() {
                if let Some(conn) = self.pool.get(&peer_id) {
                    let rtt = conn.stats().latency_ms.load(Ordering::Relaxed);
                    if rtt > 0 {
                        peers.record_latency(&peer_id, rtt, now);
                        peers.record_success(&peer_id, GoodBehavior::Pong, now);
                    }
                }
            }
        }

        // Dial discovered peers while there is pool headroom.
        let now = time::unix_ms();
        let headroom = self
            .config
            .max_connections
            .saturating_sub(self.pool.total_count());
        if headroom == 0 {
            return;
        }
        let candidates: Vec<(NodeId, String)> = {
            let peers = self.peers.lock().await;
            peers
                .dial_candidates(now)
                .into_iter()
                .take(headroom)
                .map(|record| (record.node_id.clone(), record.endpoint.clone()))
                .collect()
        };
        for (peer_id, endpoint) in candidates {
            self.clone().spawn_dial(endpoint, Some(peer_id));
        }
    }

    async fn announce_tick(self: Arc<Self>) {
        let message = {
            let mut table = self.table.lock().await;
            self.announcer.build_announcement(&mut table, time::unix_ms())
        };
        let sent = self.pool.broadcast(&message, None);
        self.metrics
            .messages_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
    }

    async fn sweep_tick(self: Arc<Self>) {
        let removed = self.table.lock().await.sweep(time::unix_ms());
        if !removed.is_empty() {
            debug!(count = removed.len(), "swept stale routes");
        }
    }

    async fn crl_tick(self: Arc<Self>) {
        let announce = self.crl.lock().await.build_announce();
        if let Some(message) = announce {
            let sent = self.pool.broadcast(&message, None);
            self.metrics
                .messages_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
    }

    async fn peer_cleanup_tick(self: Arc<Self>) {
        let now = time::unix_ms();
        let evicted = self.peers.lock().await.evict_stale(now);
        for peer_id in evicted {
            self.audit_now(
                AuditEventKind::NodeLeft,
                Some(peer_id),
                json!({ "reason": "stale" }),
            )
            .await;
        }

        let snapshot = self.peers.lock().await.snapshot();
        let _ = state::store_peer_snapshot(&self.config, &snapshot);
    }

    async fn audit_now(&self, kind: AuditEventKind, subject: Option<String>, detail: serde_json::Value) {
        self.audit
            .record(time::unix_ms(), kind, Some(self.node_id.clone()), subject, detail)
            .await;
    }
}
