//! Connection lifecycle state machine.
//!
//! `Dialing → Handshaking → Established → {Draining → Closed, Failed}`.
//! Transitions are pure so the lifecycle is testable without sockets;
//! the async connection drives this machine from its I/O tasks.

use serde::{Deserialize, Serialize};

/// Why a connection left the active states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Handshake or idle deadline expired
    Timeout,
    /// Frame-level protocol violation
    FramingError,
    /// Session or certificate authentication failed
    AuthFailed,
    /// Two consecutive liveness probes went unanswered
    PingTimeout,
    /// The send queue was saturated with undroppable control traffic
    QueueSaturated,
    /// Underlying stream error
    Io,
    /// Local side requested a graceful close
    LocalClose,
    /// Remote side announced a graceful close
    RemoteClose,
    /// The peer was revoked while connected
    Revoked,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Outbound connect in progress
    Dialing,
    /// Stream open, certificates being exchanged
    Handshaking,
    /// Mutually authenticated and usable
    Established,
    /// Graceful close: flushing queued messages
    Draining,
    /// Fully closed after a drain
    Closed,
    /// Terminated abnormally
    Failed(CloseReason),
}

/// The connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFsm {
    state: ConnectionState,
}

impl ConnectionFsm {
    /// New outbound connection, about to dial.
    pub fn dialing() -> Self {
        Self {
            state: ConnectionState::Dialing,
        }
    }

    /// New inbound connection; the stream already exists.
    pub fn handshaking() -> Self {
        Self {
            state: ConnectionState::Handshaking,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Whether frames may be sent to the peer.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Established | ConnectionState::Draining
        )
    }

    /// Whether the connection reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Failed(_)
        )
    }

    /// The stream opened: `Dialing → Handshaking`.
    pub fn on_stream_open(&mut self) -> bool {
        match self.state {
            ConnectionState::Dialing => {
                self.state = ConnectionState::Handshaking;
                true
            }
            _ => false,
        }
    }

    /// The peer's certificate verified and nonces matched:
    /// `Handshaking → Established`.
    pub fn on_peer_verified(&mut self) -> bool {
        match self.state {
            ConnectionState::Handshaking => {
                self.state = ConnectionState::Established;
                true
            }
            _ => false,
        }
    }

    /// Explicit close requested: `Established → Draining`.
    pub fn on_close_requested(&mut self) -> bool {
        match self.state {
            ConnectionState::Established => {
                self.state = ConnectionState::Draining;
                true
            }
            _ => false,
        }
    }

    /// Drain flushed every queued message: `Draining → Closed`.
    pub fn on_drained(&mut self) -> bool {
        match self.state {
            ConnectionState::Draining => {
                self.state = ConnectionState::Closed;
                true
            }
            _ => false,
        }
    }

    /// Abnormal termination from any non-terminal state.
    pub fn on_failure(&mut self, reason: CloseReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = ConnectionState::Failed(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_happy_path() {
        let mut fsm = ConnectionFsm::dialing();
        assert!(fsm.on_stream_open());
        assert_eq!(fsm.state(), &ConnectionState::Handshaking);
        assert!(fsm.on_peer_verified());
        assert!(fsm.is_active());
        assert!(fsm.on_close_requested());
        assert_eq!(fsm.state(), &ConnectionState::Draining);
        assert!(fsm.is_active());
        assert!(fsm.on_drained());
        assert!(fsm.is_terminal());
    }

    #[test]
    fn test_inbound_starts_handshaking() {
        let mut fsm = ConnectionFsm::handshaking();
        assert!(!fsm.on_stream_open());
        assert!(fsm.on_peer_verified());
        assert_eq!(fsm.state(), &ConnectionState::Established);
    }

    #[test]
    fn test_failure_from_any_live_state() {
        let mut fsm = ConnectionFsm::dialing();
        assert!(fsm.on_failure(CloseReason::Timeout));
        assert_eq!(fsm.state(), &ConnectionState::Failed(CloseReason::Timeout));

        let mut fsm = ConnectionFsm::handshaking();
        assert!(fsm.on_failure(CloseReason::AuthFailed));

        let mut fsm = ConnectionFsm::handshaking();
        fsm.on_peer_verified();
        assert!(fsm.on_failure(CloseReason::PingTimeout));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut fsm = ConnectionFsm::handshaking();
        fsm.on_failure(CloseReason::FramingError);
        assert!(!fsm.on_peer_verified());
        assert!(!fsm.on_failure(CloseReason::Io));
        assert_eq!(
            fsm.state(),
            &ConnectionState::Failed(CloseReason::FramingError)
        );
    }

    #[test]
    fn test_no_establish_before_handshake() {
        let mut fsm = ConnectionFsm::dialing();
        assert!(!fsm.on_peer_verified());
        assert!(!fsm.on_close_requested());
        assert_eq!(fsm.state(), &ConnectionState::Dialing);
    }
}
