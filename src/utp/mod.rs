//! uTP (Micro Transport Protocol) Implementation (BEP 29)
//!
//! uTP provides reliable, ordered, connection-oriented streams over UDP with
//! LEDBAT congestion control, which backs off when the queuing delay it causes
//! rises above a fixed target.
//!
//! # Architecture
//!
//! - `packet`: Header encoding/decoding (20-byte header + extensions + payload)
//! - `local_window`: Receive-side reorder buffer
//! - `remote_window`: In-flight tracking and congestion window
//! - `congestion`: LEDBAT delay estimator and RTT/timeout estimator
//! - `state`: Connection states and counters
//! - `context`: Transmit path and configuration shared by connections
//! - `connection`: Single uTP connection
//! - `server`: UDP socket demultiplexing packets to connections
//!
//! # Usage
//!
//! ```ignore
//! use utp_stream::UtpServer;
//!
//! let server = UtpServer::bind("0.0.0.0:6881".parse()?).await?;
//! let conn = server.connect("192.168.1.100:6881".parse()?).await?;
//!
//! conn.send(b"hello")?;
//! if conn.wait_for_data() {
//!     let data = conn.recv(1024)?;
//! }
//! ```

pub mod congestion;
pub mod connection;
pub mod context;
pub mod local_window;
pub mod packet;
pub mod remote_window;
pub mod server;
pub mod state;

// Re-export commonly used types
pub use congestion::{LedbatController, RttEstimator};
pub use connection::Connection;
pub use context::{PacketSink, UtpContext};
pub use local_window::LocalWindow;
pub use packet::{
    decode_packet, encode_packet, seq_less_or_equal, seq_less_than, ExtensionType, Header,
    PacketType, ParsedPacket, SelectiveAck, HEADER_SIZE, UTP_VERSION,
};
pub use remote_window::{AckOutcome, RemoteWindow, UnackedPacket};
pub use server::UtpServer;
pub use state::{ConnectionState, ConnectionStats, ConnectionType};
