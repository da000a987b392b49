//! Genesis Mesh Transport - Wire Protocol and Connection Lifecycle
//!
//! Length-prefixed framing over a stream transport, a typed message set
//! demultiplexed by kind, per-message session authentication, the
//! connection state machine, and the capacity-capped connection pool.
//!
//! The transport exclusively owns connections; higher layers refer to
//! them by `NodeId` through the pool's lookup interface.

#![warn(missing_docs)]

pub mod connection;
pub mod fsm;
pub mod pool;
pub mod protocol;
pub mod session;

pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionStats};
pub use fsm::{CloseReason, ConnectionFsm, ConnectionState};
pub use pool::ConnectionPool;
pub use protocol::{
    decode_payload, encode_frame, read_frame, DataPayload, HandshakeAckPayload, HandshakePayload,
    Message, MessageKind, PeerEntry, PingPayload, PongPayload, RouteAdvert, RouteWithdrawal,
    TransportError, MAX_FRAME_LEN, PROTOCOL_VERSION,
};
pub use session::SessionKey;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
