//! Async peer connection: framed I/O tasks, send-queue backpressure,
//! and liveness probing over one TCP stream.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use genesis_mesh_core::{time, NodeId};

use crate::fsm::{CloseReason, ConnectionFsm, ConnectionState};
use crate::protocol::{encode_frame, read_frame, Message, PingPayload, PongPayload, TransportError};
use crate::session::SessionKey;

/// Timing and capacity knobs for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for completing the handshake
    pub handshake_timeout: Duration,
    /// Read inactivity deadline
    pub idle_timeout: Duration,
    /// Liveness probe cadence
    pub ping_interval: Duration,
    /// Silence on the pong path that forces a failure
    pub ping_timeout: Duration,
    /// Bounded send queue capacity
    pub send_queue_capacity: usize,
    /// Flush budget for a graceful drain
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(60),
            send_queue_capacity: 256,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Events surfaced to the node's dispatcher.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A message arrived on an open connection
    Inbound {
        /// Connection that produced the message
        conn_id: u64,
        /// The decoded message
        message: Message,
    },
    /// The connection reached a terminal state
    Closed {
        /// Connection that closed
        conn_id: u64,
        /// Final state (`Closed` or `Failed(reason)`)
        state: ConnectionState,
    },
}

/// Connection counters, updated by the I/O tasks.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Messages written to the stream
    pub messages_sent: AtomicU64,
    /// Messages decoded from the stream
    pub messages_received: AtomicU64,
    /// Bytes written
    pub bytes_sent: AtomicU64,
    /// Messages dropped by send-queue backpressure
    pub messages_dropped: AtomicU64,
    /// Last observed round-trip time, ms (0 = not yet measured)
    pub latency_ms: AtomicU64,
}

struct SendQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

struct QueueInner {
    queue: VecDeque<Message>,
    closed: bool,
}

enum PushOutcome {
    Queued,
    DroppedOldest,
    DroppedIncoming,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue a message under the backpressure policy: overflow drops
    /// the oldest non-control message; control messages are never
    /// dropped, and a queue saturated with control traffic is fatal.
    fn push(&self, message: Message) -> Result<PushOutcome, TransportError> {
        let outcome;
        {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(_) => return Err(TransportError::ConnectionClosed),
            };
            if inner.closed {
                return Err(TransportError::ConnectionClosed);
            }

            if inner.queue.len() < self.capacity {
                inner.queue.push_back(message);
                outcome = PushOutcome::Queued;
            } else {
                let victim = inner.queue.iter().position(|m| !m.is_control());
                match victim {
                    Some(index) => {
                        inner.queue.remove(index);
                        inner.queue.push_back(message);
                        outcome = PushOutcome::DroppedOldest;
                    }
                    None if message.is_control() => {
                        return Err(TransportError::ProtocolViolation(
                            "send queue saturated with control traffic".to_string(),
                        ));
                    }
                    None => {
                        outcome = PushOutcome::DroppedIncoming;
                    }
                }
            }
        }
        self.notify.notify_one();
        Ok(outcome)
    }

    async fn pop(&self) -> Option<Message> {
        loop {
            {
                let mut inner = self.inner.lock().ok()?;
                if let Some(message) = inner.queue.pop_front() {
                    return Some(message);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.queue.len()).unwrap_or(0)
    }
}

/// One peer connection owned by the transport.
///
/// The state machine is driven by the spawned reader, writer, and
/// liveness tasks; higher layers interact through [`Connection::send`],
/// [`Connection::mark_established`], and [`Connection::begin_drain`].
pub struct Connection {
    /// Transport-assigned connection id
    pub id: u64,
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// Whether we dialed (true) or accepted (false)
    pub outbound: bool,
    fsm: Mutex<ConnectionFsm>,
    peer_id: OnceLock<NodeId>,
    session: OnceLock<SessionKey>,
    queue: SendQueue,
    stats: ConnectionStats,
    config: ConnectionConfig,
    last_pong_ms: AtomicU64,
    closed_tx: watch::Sender<bool>,
    session_tx: watch::Sender<bool>,
}

impl Connection {
    /// Take ownership of a stream and spawn the connection's I/O tasks.
    ///
    /// Inbound messages and the terminal close event are delivered to
    /// `events`. The returned handle is shared with the pool.
    pub fn spawn(
        stream: TcpStream,
        id: u64,
        remote_addr: SocketAddr,
        outbound: bool,
        config: ConnectionConfig,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Arc<Connection> {
        let fsm = if outbound {
            let mut fsm = ConnectionFsm::dialing();
            fsm.on_stream_open();
            fsm
        } else {
            ConnectionFsm::handshaking()
        };

        let (closed_tx, _) = watch::channel(false);
        let (session_tx, _) = watch::channel(false);

        let conn = Arc::new(Connection {
            id,
            remote_addr,
            outbound,
            fsm: Mutex::new(fsm),
            peer_id: OnceLock::new(),
            session: OnceLock::new(),
            queue: SendQueue::new(config.send_queue_capacity),
            stats: ConnectionStats::default(),
            config: config.clone(),
            last_pong_ms: AtomicU64::new(0),
            closed_tx,
            session_tx,
        });

        let (read_half, write_half) = stream.into_split();

        let reader = tokio::spawn(Self::read_loop(conn.clone(), read_half, events.clone()));
        let writer = tokio::spawn(Self::write_loop(conn.clone(), write_half));
        let liveness = tokio::spawn(Self::liveness_loop(conn.clone()));

        // Supervisor: once the I/O tasks finish, emit the terminal event.
        let supervised = conn.clone();
        tokio::spawn(async move {
            let _ = reader.await;
            supervised.queue.close();
            let _ = writer.await;
            liveness.abort();

            let state = supervised.state();
            let _ = events
                .send(ConnectionEvent::Closed {
                    conn_id: supervised.id,
                    state,
                })
                .await;
        });

        conn
    }

    /// Dial a remote endpoint with the handshake deadline as connect
    /// timeout, then spawn the connection.
    pub async fn dial(
        addr: SocketAddr,
        id: u64,
        config: ConnectionConfig,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<Connection>, TransportError> {
        let stream = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("dial {}", addr)))??;
        Ok(Self::spawn(stream, id, addr, true, config, events))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.fsm
            .lock()
            .map(|fsm| fsm.state().clone())
            .unwrap_or(ConnectionState::Failed(CloseReason::Io))
    }

    /// Whether the connection is established.
    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Whether the connection reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.fsm
            .lock()
            .map(|fsm| fsm.is_terminal())
            .unwrap_or(true)
    }

    /// Peer node id, once the handshake verified it.
    pub fn peer_id(&self) -> Option<&NodeId> {
        self.peer_id.get()
    }

    /// Connection counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Current send queue depth.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Promote the connection after certificate verification and nonce
    /// match. Returns false if the handshake already concluded.
    pub fn mark_established(&self, peer_id: NodeId, session: SessionKey) -> bool {
        if self.peer_id.set(peer_id).is_err() || self.session.set(session).is_err() {
            return false;
        }
        self.last_pong_ms.store(time::unix_ms(), Ordering::Relaxed);
        let promoted = match self.fsm.lock() {
            Ok(mut fsm) => fsm.on_peer_verified(),
            Err(_) => false,
        };
        if promoted {
            let _ = self.session_tx.send(true);
        }
        promoted
    }

    /// Enqueue a message for the writer task.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        {
            let fsm = self
                .fsm
                .lock()
                .map_err(|_| TransportError::ConnectionClosed)?;
            if fsm.is_terminal() {
                return Err(TransportError::ConnectionClosed);
            }
            let handshake_frame = !message.kind().requires_session_tag();
            if !fsm.is_active() && !handshake_frame {
                return Err(TransportError::ConnectionClosed);
            }
        }

        match self.queue.push(message) {
            Ok(PushOutcome::Queued) => Ok(()),
            Ok(PushOutcome::DroppedOldest) | Ok(PushOutcome::DroppedIncoming) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TransportError::ProtocolViolation(reason)) => {
                warn!(conn_id = self.id, %reason, "failing saturated connection");
                self.fail(CloseReason::QueueSaturated);
                Err(TransportError::ProtocolViolation(reason))
            }
            Err(other) => Err(other),
        }
    }

    /// Begin a graceful close: announce the disconnect, flush the queue,
    /// then close. A watchdog force-fails the connection if the drain
    /// exceeds its budget.
    pub fn begin_drain(self: &Arc<Self>, reason: &str) {
        let initiated = match self.fsm.lock() {
            Ok(mut fsm) => fsm.on_close_requested(),
            Err(_) => false,
        };
        if !initiated {
            return;
        }

        let _ = self.queue.push(Message::Disconnect {
            reason: reason.to_string(),
        });
        self.queue.close();

        let conn = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(conn.config.drain_timeout).await;
            if !conn.is_terminal() {
                conn.fail(CloseReason::LocalClose);
            }
        });
    }

    /// Force the connection into `Failed(reason)`.
    pub fn fail(&self, reason: CloseReason) {
        if let Ok(mut fsm) = self.fsm.lock() {
            if fsm.on_failure(reason) {
                self.queue.close();
                let _ = self.closed_tx.send(true);
            }
        }
    }

    async fn read_loop(
        conn: Arc<Connection>,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        events: mpsc::Sender<ConnectionEvent>,
    ) {
        let mut closed_rx = conn.closed_tx.subscribe();

        loop {
            if conn.is_terminal() {
                break;
            }

            let deadline = if conn.session.get().is_some() {
                conn.config.idle_timeout
            } else {
                conn.config.handshake_timeout
            };

            let read = tokio::time::timeout(
                deadline,
                read_frame(&mut reader, || conn.session.get().cloned()),
            );
            let result = tokio::select! {
                _ = closed_rx.changed() => break,
                result = read => result,
            };

            let message = match result {
                Err(_) => {
                    debug!(conn_id = conn.id, "read deadline expired");
                    conn.fail(CloseReason::Timeout);
                    break;
                }
                Ok(Err(TransportError::AuthFailed)) => {
                    conn.fail(CloseReason::AuthFailed);
                    break;
                }
                Ok(Err(TransportError::ProtocolViolation(reason))) => {
                    debug!(conn_id = conn.id, %reason, "framing error");
                    conn.fail(CloseReason::FramingError);
                    break;
                }
                Ok(Err(TransportError::Encoding(e))) => {
                    debug!(conn_id = conn.id, error = %e, "undecodable payload");
                    conn.fail(CloseReason::FramingError);
                    break;
                }
                Ok(Err(_)) => {
                    conn.fail(CloseReason::Io);
                    break;
                }
                Ok(Ok(None)) => continue, // unknown kind, ignored
                Ok(Ok(Some(message))) => message,
            };

            conn.stats.messages_received.fetch_add(1, Ordering::Relaxed);

            match message {
                Message::Ping(ping) => {
                    let pong = Message::Pong(PongPayload {
                        ping_timestamp_ms: ping.timestamp_ms,
                        pong_timestamp_ms: time::unix_ms(),
                    });
                    let _ = conn.send(pong);
                }
                Message::Pong(pong) => {
                    let now = time::unix_ms();
                    conn.last_pong_ms.store(now, Ordering::Relaxed);
                    let rtt = now.saturating_sub(pong.ping_timestamp_ms);
                    conn.stats.latency_ms.store(rtt, Ordering::Relaxed);
                }
                Message::Disconnect { .. } => {
                    conn.fail(CloseReason::RemoteClose);
                    let _ = events
                        .send(ConnectionEvent::Inbound {
                            conn_id: conn.id,
                            message,
                        })
                        .await;
                    break;
                }
                handshake @ (Message::Handshake(_) | Message::HandshakeAck(_)) => {
                    if events
                        .send(ConnectionEvent::Inbound {
                            conn_id: conn.id,
                            message: handshake,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    // Hold the read side until the peer layer either
                    // installs the session or fails the connection, so
                    // the next (authenticated) frame finds the key.
                    if !conn.await_handshake_conclusion(&mut closed_rx).await {
                        conn.fail(CloseReason::Timeout);
                        break;
                    }
                }
                other => {
                    if events
                        .send(ConnectionEvent::Inbound {
                            conn_id: conn.id,
                            message: other,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    async fn await_handshake_conclusion(&self, closed_rx: &mut watch::Receiver<bool>) -> bool {
        if self.session.get().is_some() {
            return true;
        }
        let mut session_rx = self.session_tx.subscribe();
        let wait = session_rx.wait_for(|installed| *installed);
        tokio::select! {
            _ = closed_rx.changed() => false,
            result = tokio::time::timeout(self.config.handshake_timeout, wait) => {
                matches!(result, Ok(Ok(_)))
            }
        }
    }

    async fn write_loop(conn: Arc<Connection>, mut writer: tokio::net::tcp::OwnedWriteHalf) {
        while let Some(message) = conn.queue.pop().await {
            let frame = match encode_frame(&message, conn.session.get()) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(conn_id = conn.id, error = %e, "dropping unencodable frame");
                    continue;
                }
            };

            if let Err(e) = writer.write_all(&frame).await {
                debug!(conn_id = conn.id, error = %e, "write failed");
                conn.fail(CloseReason::Io);
                return;
            }
            conn.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            conn.stats
                .bytes_sent
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
        }

        // Queue drained and closed: finish a graceful drain.
        let _ = writer.flush().await;
        if let Ok(mut fsm) = conn.fsm.lock() {
            fsm.on_drained();
        }
    }

    async fn liveness_loop(conn: Arc<Connection>) {
        // First wait doubles as the handshake watchdog.
        tokio::time::sleep(conn.config.handshake_timeout).await;
        if !conn.is_established() && !conn.is_terminal() {
            conn.fail(CloseReason::Timeout);
            return;
        }

        let mut ticker = tokio::time::interval(conn.config.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if conn.is_terminal() {
                return;
            }
            if !conn.is_established() {
                continue;
            }

            let last_pong = conn.last_pong_ms.load(Ordering::Relaxed);
            let silence = time::unix_ms().saturating_sub(last_pong);
            if silence > conn.config.ping_timeout.as_millis() as u64 {
                warn!(conn_id = conn.id, silence_ms = silence, "pong silence, failing");
                conn.fail(CloseReason::PingTimeout);
                return;
            }

            let _ = conn.send(Message::Ping(PingPayload {
                timestamp_ms: time::unix_ms(),
            }));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("state", &self.state())
            .field("peer_id", &self.peer_id.get())
            .finish()
    }
}
