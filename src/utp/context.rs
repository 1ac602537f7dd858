//! Shared collaborators handed to every connection
//!
//! Connections never own a socket. They reach the network through a
//! [`PacketSink`] and read their tunables from the shared [`UtpConfig`];
//! both travel together in a [`UtpContext`] built by whoever owns the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::UtpConfig;

/// Datagram transmit capability
pub trait PacketSink: Send + Sync {
    /// Send one datagram; `false` on a local send failure
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> bool;
}

/// Configuration and transmit path shared by connections of one endpoint
#[derive(Clone)]
pub struct UtpContext {
    config: Arc<UtpConfig>,
    sink: Arc<dyn PacketSink>,
}

impl UtpContext {
    pub fn new(config: UtpConfig, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            config: Arc::new(config),
            sink,
        }
    }

    pub fn config(&self) -> &UtpConfig {
        &self.config
    }

    pub fn sink(&self) -> &dyn PacketSink {
        self.sink.as_ref()
    }
}

impl std::fmt::Debug for UtpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
