//! Connection pool: capacity enforcement, dial dedup, and lookup by node id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use genesis_mesh_core::NodeId;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::protocol::{Message, TransportError};

/// The transport's registry of live connections.
///
/// The pool is the arena that owns connection handles; the peer manager
/// and router refer to connections only by `NodeId` through this
/// interface. Accepts beyond the capacity cap are refused with
/// `PoolFull`; outbound dials are deduplicated by node id.
pub struct ConnectionPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Established connections by peer node id
    by_peer: HashMap<NodeId, Arc<Connection>>,
    /// Connections mid-handshake, by connection id
    pending: HashMap<u64, Arc<Connection>>,
    /// Node ids with a dial in flight
    dialing: HashSet<NodeId>,
    next_conn_id: u64,
}

impl ConnectionPool {
    /// Create a pool capped at `capacity` concurrent connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                by_peer: HashMap::new(),
                pending: HashMap::new(),
                dialing: HashSet::new(),
                next_conn_id: 1,
            }),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate a connection id and reserve a slot, or refuse with
    /// `PoolFull` when at capacity.
    pub fn reserve_slot(&self) -> Result<u64, TransportError> {
        let mut inner = self.lock()?;
        if inner.by_peer.len() + inner.pending.len() >= self.capacity {
            warn!(capacity = self.capacity, "connection pool full");
            return Err(TransportError::PoolFull {
                capacity: self.capacity,
            });
        }
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        Ok(id)
    }

    /// Mark a dial to `peer_id` in flight. Returns false if one already
    /// is, or the peer is already connected.
    pub fn begin_dial(&self, peer_id: &NodeId) -> bool {
        match self.lock() {
            Ok(mut inner) => {
                if inner.by_peer.contains_key(peer_id) {
                    return false;
                }
                inner.dialing.insert(peer_id.clone())
            }
            Err(_) => false,
        }
    }

    /// Clear the in-flight dial marker for `peer_id`.
    pub fn finish_dial(&self, peer_id: &NodeId) {
        if let Ok(mut inner) = self.lock() {
            inner.dialing.remove(peer_id);
        }
    }

    /// Track a connection that is still handshaking.
    pub fn track_pending(&self, conn: Arc<Connection>) {
        if let Ok(mut inner) = self.lock() {
            inner.pending.insert(conn.id, conn);
        }
    }

    /// Promote a pending connection to established under its peer id.
    ///
    /// If the peer already has an established connection the newer one
    /// loses and is returned as `Err` for the caller to drop.
    pub fn promote(
        &self,
        conn_id: u64,
        peer_id: &NodeId,
    ) -> Result<Arc<Connection>, Option<Arc<Connection>>> {
        let mut inner = match self.lock() {
            Ok(inner) => inner,
            Err(_) => return Err(None),
        };
        let conn = match inner.pending.remove(&conn_id) {
            Some(conn) => conn,
            None => return Err(None),
        };
        if inner.by_peer.contains_key(peer_id) {
            debug!(%peer_id, conn_id, "duplicate connection to peer, dropping newer");
            return Err(Some(conn));
        }
        inner.dialing.remove(peer_id);
        inner.by_peer.insert(peer_id.clone(), conn.clone());
        Ok(conn)
    }

    /// Remove a connection in any stage; returns its peer id if it was
    /// established.
    pub fn remove(&self, conn_id: u64) -> Option<NodeId> {
        let mut inner = self.lock().ok()?;
        inner.pending.remove(&conn_id);
        let peer = inner
            .by_peer
            .iter()
            .find(|(_, conn)| conn.id == conn_id)
            .map(|(peer_id, _)| peer_id.clone());
        if let Some(ref peer_id) = peer {
            inner.by_peer.remove(peer_id);
        }
        peer
    }

    /// Look up an established connection by peer node id.
    pub fn get(&self, peer_id: &NodeId) -> Option<Arc<Connection>> {
        self.lock().ok()?.by_peer.get(peer_id).cloned()
    }

    /// Look up any tracked connection by connection id.
    pub fn get_by_conn_id(&self, conn_id: u64) -> Option<Arc<Connection>> {
        let inner = self.lock().ok()?;
        if let Some(conn) = inner.pending.get(&conn_id) {
            return Some(conn.clone());
        }
        inner
            .by_peer
            .values()
            .find(|conn| conn.id == conn_id)
            .cloned()
    }

    /// Node ids of all established connections.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.lock()
            .map(|inner| inner.by_peer.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Established connection count.
    pub fn established_count(&self) -> usize {
        self.lock().map(|inner| inner.by_peer.len()).unwrap_or(0)
    }

    /// Total tracked connections, including pending handshakes.
    pub fn total_count(&self) -> usize {
        self.lock()
            .map(|inner| inner.by_peer.len() + inner.pending.len())
            .unwrap_or(0)
    }

    /// Send to one established peer.
    pub fn send_to(&self, peer_id: &NodeId, message: Message) -> Result<(), TransportError> {
        match self.get(peer_id) {
            Some(conn) => conn.send(message),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Broadcast to every established peer except `exclude`.
    ///
    /// Returns the number of peers the message was queued for.
    pub fn broadcast(&self, message: &Message, exclude: Option<&NodeId>) -> usize {
        let targets: Vec<Arc<Connection>> = match self.lock() {
            Ok(inner) => inner
                .by_peer
                .iter()
                .filter(|(peer_id, _)| match exclude {
                    Some(excluded) => *peer_id != excluded,
                    None => true,
                })
                .map(|(_, conn)| conn.clone())
                .collect(),
            Err(_) => return 0,
        };

        let mut queued = 0;
        for conn in targets {
            if conn.send(message.clone()).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    /// Drain every connection for shutdown.
    pub fn drain_all(&self, reason: &str) {
        let conns: Vec<Arc<Connection>> = match self.lock() {
            Ok(inner) => inner
                .by_peer
                .values()
                .cloned()
                .chain(inner.pending.values().cloned())
                .collect(),
            Err(_) => return,
        };
        for conn in conns {
            conn.begin_drain(reason);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolInner>, TransportError> {
        self.inner
            .lock()
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
