//! uTP Connection State Machine
//!
//! This module defines the states a uTP connection can be in and
//! the per-connection counters.

/// uTP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// SYN sent, waiting for the STATE reply (initiator)
    SynSent,

    /// Waiting for the peer's SYN (responder)
    Idle,

    /// Connection established, data transfer active
    Connected,

    /// A FIN was exchanged; remaining packets are being drained
    Finished,

    /// Terminal state
    Closed,
}

impl ConnectionState {
    /// Check if the connection is in a state where data can be sent
    pub fn can_send_data(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the handshake is still pending
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Self::SynSent | Self::Idle)
    }

    /// Check if the connection is closed (terminal state)
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// No more data will arrive from the peer
    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Finished | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::Idle => write!(f, "IDLE"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Finished => write!(f, "FINISHED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Which side initiated the association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Outgoing,
    Incoming,
}

impl ConnectionType {
    /// Send id derived from the receive id
    pub fn send_connection_id(&self, recv_connection_id: u16) -> u16 {
        match self {
            Self::Outgoing => recv_connection_id.wrapping_add(1),
            Self::Incoming => recv_connection_id.wrapping_sub(1),
        }
    }

    pub fn initial_state(&self) -> ConnectionState {
        match self {
            Self::Outgoing => ConnectionState::SynSent,
            Self::Incoming => ConnectionState::Idle,
        }
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Packets sent
    pub packets_sent: u64,

    /// Packets received
    pub packets_received: u64,

    /// Bytes sent (payload only)
    pub bytes_sent: u64,

    /// Bytes received (payload only)
    pub bytes_received: u64,

    /// Packets retransmitted
    pub retransmits: u64,

    /// Duplicate ACKs received
    pub duplicate_acks: u64,

    /// Timeouts
    pub timeouts: u64,

    /// Datagrams rejected by the decoder
    pub malformed_packets: u64,

    /// Datagrams the sink refused
    pub send_failures: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.packets_sent += 1;
        self.bytes_sent += bytes;
    }

    pub fn record_received(&mut self, bytes: u64) {
        self.packets_received += 1;
        self.bytes_received += bytes;
    }

    pub fn record_retransmit(&mut self) {
        self.retransmits += 1;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn record_duplicate_ack(&mut self) {
        self.duplicate_acks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::SynSent.is_handshaking());
        assert!(ConnectionState::Idle.is_handshaking());
        assert!(!ConnectionState::SynSent.can_send_data());

        assert!(ConnectionState::Connected.can_send_data());
        assert!(!ConnectionState::Connected.is_draining());

        assert!(!ConnectionState::Finished.can_send_data());
        assert!(ConnectionState::Finished.is_draining());

        assert!(ConnectionState::Closed.is_closed());
        assert_eq!(ConnectionState::Closed.to_string(), "CLOSED");
    }

    #[test]
    fn test_connection_id_symmetry() {
        assert_eq!(ConnectionType::Outgoing.send_connection_id(100), 101);
        assert_eq!(ConnectionType::Incoming.send_connection_id(101), 100);
        assert_eq!(ConnectionType::Outgoing.send_connection_id(u16::MAX), 0);
        assert_eq!(ConnectionType::Incoming.send_connection_id(0), u16::MAX);
    }

    #[test]
    fn test_initial_states() {
        assert_eq!(ConnectionType::Outgoing.initial_state(), ConnectionState::SynSent);
        assert_eq!(ConnectionType::Incoming.initial_state(), ConnectionState::Idle);
    }

    #[test]
    fn test_connection_stats() {
        let mut stats = ConnectionStats::new();
        stats.record_sent(100);
        stats.record_received(200);
        stats.record_timeout();

        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.timeouts, 1);
    }
}
