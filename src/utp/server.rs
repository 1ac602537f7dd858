//! uTP Server
//!
//! One UDP socket shared by every connection of an endpoint. Incoming
//! datagrams are routed to their connection by (remote address, connection
//! ID); SYNs for unknown IDs create incoming connections that are handed out
//! by [`UtpServer::accept`]. A timer task drives retransmission timeouts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::Connection;
use super::context::{PacketSink, UtpContext};
use super::packet::{decode_packet, encode_packet, Header, PacketType};
use super::state::ConnectionState;
use crate::config::UtpConfig;
use crate::error::{Result, UtpError};

/// Receive buffer; larger than any packet we ever send
const RECV_BUFFER_SIZE: usize = 2048;

/// Attempts at drawing an unused connection ID
const CONNECTION_ID_ATTEMPTS: usize = 64;

/// Key for identifying a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionKey {
    remote_addr: SocketAddr,
    recv_id: u16,
}

type ConnectionTable = RwLock<HashMap<ConnectionKey, Arc<Connection>>>;

/// Non-blocking transmit path over the shared socket
struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl PacketSink for UdpSink {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> bool {
        match self.socket.try_send_to(data, addr) {
            Ok(_) => true,
            Err(e) => {
                tracing::trace!("UDP send to {} failed: {}", addr, e);
                false
            }
        }
    }
}

/// uTP endpoint bound to a UDP socket
pub struct UtpServer {
    local_addr: SocketAddr,

    context: UtpContext,

    connections: Arc<ConnectionTable>,

    /// Incoming connections waiting to be accepted
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,

    /// Background tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UtpServer {
    /// Bind with the default configuration
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, UtpConfig::default()).await
    }

    pub async fn bind_with_config(addr: SocketAddr, config: UtpConfig) -> Result<Self> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let check_interval = Duration::from_millis(config.timeout_check_interval_ms);
        let backlog = config.accept_backlog;

        let sink = Arc::new(UdpSink {
            socket: socket.clone(),
        });
        let context = UtpContext::new(config, sink);
        let connections: Arc<ConnectionTable> = Arc::new(RwLock::new(HashMap::new()));
        let (accept_tx, accept_rx) = mpsc::channel(backlog);

        let recv_task = tokio::spawn(Self::recv_loop(
            socket,
            connections.clone(),
            context.clone(),
            accept_tx,
        ));
        let timer_task = tokio::spawn(Self::timer_loop(connections.clone(), check_interval));

        tracing::info!("uTP server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            context,
            connections,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            tasks: Mutex::new(vec![recv_task, timer_task]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &UtpConfig {
        self.context.config()
    }

    /// Connections currently routed by this server
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        connections: Arc<ConnectionTable>,
        context: UtpContext,
        accept_tx: mpsc::Sender<Arc<Connection>>,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, remote_addr)) => {
                    Self::route_packet(&buf[..len], remote_addr, &connections, &context, &accept_tx);
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    // ICMP port unreachable surfacing on some platforms
                    continue;
                }
                Err(e) => {
                    tracing::error!("UDP receive error: {}", e);
                    break;
                }
            }
        }
    }

    /// Deliver one datagram to its connection
    fn route_packet(
        raw: &[u8],
        remote_addr: SocketAddr,
        connections: &ConnectionTable,
        context: &UtpContext,
        accept_tx: &mpsc::Sender<Arc<Connection>>,
    ) {
        let header = match decode_packet(raw) {
            Ok(parsed) => parsed.header,
            Err(e) => {
                tracing::debug!("Failed to decode uTP packet from {}: {}", remote_addr, e);
                return;
            }
        };

        // A SYN names the initiator's receive ID; we receive on the next one
        let recv_id = if header.packet_type == PacketType::Syn {
            header.connection_id.wrapping_add(1)
        } else {
            header.connection_id
        };
        let key = ConnectionKey {
            remote_addr,
            recv_id,
        };

        let existing = connections.read().get(&key).cloned();
        if let Some(conn) = existing {
            conn.handle_packet(raw);
            return;
        }

        match header.packet_type {
            PacketType::Syn => {
                let conn = Arc::new(Connection::incoming(recv_id, remote_addr, context.clone()));
                if conn.handle_packet(raw) != ConnectionState::Connected {
                    return;
                }

                match accept_tx.try_send(conn.clone()) {
                    Ok(()) => {
                        connections.write().insert(key, conn);
                        tracing::debug!("uTP: incoming connection {} from {}", recv_id, remote_addr);
                    }
                    Err(_) => {
                        tracing::warn!(
                            "uTP: accept backlog full, refusing {} ({})",
                            remote_addr,
                            UtpError::ResourceLimit {
                                resource: "accept backlog",
                                limit: context.config().accept_backlog,
                            }
                        );
                        conn.close();
                        Self::send_reset(context, &header, remote_addr);
                    }
                }
            }
            // Never answer a RESET
            PacketType::Reset => {}
            _ => {
                tracing::trace!(
                    "uTP: {} for unknown connection {} from {}",
                    header.packet_type,
                    header.connection_id,
                    remote_addr
                );
                Self::send_reset(context, &header, remote_addr);
            }
        }
    }

    fn send_reset(context: &UtpContext, header: &Header, remote_addr: SocketAddr) {
        let reset = Header::new(PacketType::Reset, header.connection_id, 0, header.seq_nr);
        context
            .sink()
            .send_to(&encode_packet(&reset, None, &[]), remote_addr);
    }

    async fn timer_loop(connections: Arc<ConnectionTable>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let snapshot: Vec<Arc<Connection>> = connections.read().values().cloned().collect();
            for conn in &snapshot {
                conn.check_timeout();
            }

            connections.write().retain(|key, conn| {
                let keep = conn.state() != ConnectionState::Closed;
                if !keep {
                    tracing::debug!(
                        "uTP: forgetting closed connection {} with {}",
                        key.recv_id,
                        key.remote_addr
                    );
                }
                keep
            });
        }
    }

    /// Open a connection and wait for the handshake
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        let (key, conn) = {
            // Held across construction so the reply cannot race the insert
            let mut table = self.connections.write();
            let key = (0..CONNECTION_ID_ATTEMPTS)
                .map(|_| ConnectionKey {
                    remote_addr: addr,
                    recv_id: rand::random(),
                })
                .find(|key| !table.contains_key(key))
                .ok_or(UtpError::ResourceLimit {
                    resource: "connection ids",
                    limit: u16::MAX as usize,
                })?;

            let conn = Arc::new(Connection::outgoing(key.recv_id, addr, self.context.clone()));
            table.insert(key, conn.clone());
            (key, conn)
        };

        let timeout = Duration::from_secs(self.context.config().connect_timeout_secs);
        let waiter = conn.clone();
        let established = tokio::task::spawn_blocking(move || waiter.wait_until_connected_timeout(timeout))
            .await
            .map_err(|_| UtpError::Shutdown)?;

        if established && conn.state().can_send_data() {
            return Ok(conn);
        }

        let state = conn.state();
        conn.close();
        self.connections.write().remove(&key);

        if state == ConnectionState::Closed {
            Err(UtpError::ConnectionRefused(addr))
        } else {
            Err(UtpError::TimedOut)
        }
    }

    /// Wait for the next incoming connection
    pub async fn accept(&self) -> Result<Arc<Connection>> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(UtpError::Shutdown)
    }

    /// Stop background tasks and close every connection
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let connections: Vec<Arc<Connection>> =
            self.connections.write().drain().map(|(_, conn)| conn).collect();
        for conn in connections {
            conn.close();
        }
        tracing::info!("uTP server on {} shut down", self.local_addr);
    }
}

impl Drop for UtpServer {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for UtpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn read_blocking(conn: Arc<Connection>) -> Vec<u8> {
        tokio::task::spawn_blocking(move || {
            conn.wait_for_data_timeout(Duration::from_secs(5));
            conn.recv(usize::MAX).unwrap().to_vec()
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_accept_and_transfer() {
        let server = UtpServer::bind(localhost()).await.unwrap();
        let client = UtpServer::bind(localhost()).await.unwrap();

        let (outgoing, incoming) = tokio::join!(client.connect(server.local_addr()), server.accept());
        let outgoing = outgoing.unwrap();
        let incoming = incoming.unwrap();

        assert_eq!(outgoing.state(), ConnectionState::Connected);
        assert_eq!(incoming.state(), ConnectionState::Connected);
        assert_eq!(outgoing.send_connection_id(), incoming.recv_connection_id());
        assert_eq!(incoming.send_connection_id(), outgoing.recv_connection_id());

        assert_eq!(outgoing.send(b"hello").unwrap(), 5);
        assert_eq!(read_blocking(incoming.clone()).await, b"hello");

        incoming.send(b"world").unwrap();
        assert_eq!(read_blocking(outgoing).await, b"world");

        assert_eq!(server.connection_count(), 1);
        assert_eq!(client.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_gets_reset() {
        let server = UtpServer::bind(localhost()).await.unwrap();
        let stranger = UdpSocket::bind(localhost()).await.unwrap();

        let data = encode_packet(&Header::new(PacketType::Data, 4242, 7, 0), None, b"?");
        stranger.send_to(&data, server.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), stranger.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = decode_packet(&buf[..len]).unwrap().header;
        assert_eq!(reply.packet_type, PacketType::Reset);
        assert_eq!(reply.connection_id, 4242);
        assert_eq!(reply.ack_nr, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_refused_by_reset() {
        let client = UtpServer::bind(localhost()).await.unwrap();
        let peer = UdpSocket::bind(localhost()).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            let syn = decode_packet(&buf[..len]).unwrap().header;
            assert_eq!(syn.packet_type, PacketType::Syn);
            let reset = Header::new(PacketType::Reset, syn.connection_id, 1, syn.seq_nr);
            peer.send_to(&encode_packet(&reset, None, &[]), from).await.unwrap();
        });

        let err = client.connect(peer_addr).await.unwrap_err();
        assert!(matches!(err, UtpError::ConnectionRefused(addr) if addr == peer_addr));
        assert_eq!(client.connection_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_times_out() {
        let config = UtpConfig::default().connect_timeout(Duration::from_secs(1));
        let client = UtpServer::bind_with_config(localhost(), config).await.unwrap();
        // Bound but silent
        let silent = UdpSocket::bind(localhost()).await.unwrap();

        let err = client.connect(silent.local_addr().unwrap()).await.unwrap_err();
        assert!(matches!(err, UtpError::TimedOut));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = UtpConfig::default().target_delay(Duration::ZERO);
        assert!(UtpServer::bind_with_config(localhost(), config).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_ends_accept() {
        let server = UtpServer::bind(localhost()).await.unwrap();
        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), server.accept()).await.unwrap();
        assert!(matches!(result, Err(UtpError::Shutdown)));
    }
}
