//! Typed error hierarchy for utp-stream
//!
//! Malformed datagrams, stream misuse and local socket failures are kept
//! apart so callers can tell a dropped packet from a dead connection.

use std::net::SocketAddr;
use thiserror::Error;

use crate::utp::ConnectionState;

/// Main error type for the uTP engine
#[derive(Debug, Error)]
pub enum UtpError {
    /// A datagram that could not be decoded
    #[error("Malformed packet ({kind}): {message}")]
    Malformed {
        kind: MalformedKind,
        message: String,
    },

    /// Stream operation attempted before the handshake completed
    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// The connection reached the terminal state
    #[error("Connection closed")]
    ConnectionClosed,

    /// Handshake did not complete in time
    #[error("Connection timed out")]
    TimedOut,

    /// Peer reset or never answered the handshake
    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    /// Invalid input from user
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Resource limits exceeded
    #[error("Resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimit {
        resource: &'static str,
        limit: usize,
    },

    /// Local socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server is shutting down
    #[error("Server is shutting down")]
    Shutdown,
}

/// Malformed packet subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Shorter than the fixed header
    Truncated,
    /// Version nibble is not 1
    UnsupportedVersion,
    /// Type nibble outside SYN/DATA/STATE/FIN/RESET
    UnknownPacketType,
    /// Extension block extends past the end of the datagram
    ExtensionOverrun,
}

impl std::fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated"),
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::UnknownPacketType => write!(f, "unknown type"),
            Self::ExtensionOverrun => write!(f, "extension overrun"),
        }
    }
}

impl UtpError {
    /// Create a malformed packet error
    pub fn malformed(kind: MalformedKind, message: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Whether the error concerns a single datagram rather than the stream
    pub fn is_packet_error(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Check if the operation may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected { state } => !state.is_closed(),
            Self::TimedOut => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Result type alias for uTP operations
pub type Result<T> = std::result::Result<T, UtpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display() {
        let err = UtpError::malformed(MalformedKind::Truncated, "3 bytes");
        assert_eq!(err.to_string(), "Malformed packet (truncated): 3 bytes");
        assert!(err.is_packet_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_connected_retryable() {
        let err = UtpError::NotConnected {
            state: ConnectionState::SynSent,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("SYN_SENT"));

        let err = UtpError::NotConnected {
            state: ConnectionState::Closed,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy");
        let err: UtpError = io.into();
        assert!(matches!(err, UtpError::Io(_)));
        assert!(err.is_retryable());
    }
}
