//! # utp-stream
//!
//! A uTP (BEP 29) transport engine: reliable, ordered byte streams over UDP
//! with delay-based LEDBAT congestion control.
//!
//! ## Features
//!
//! - **Wire codec**: 20-byte header, extension chain and selective acks
//! - **Reliable delivery**: reorder buffer, cumulative and selective acks,
//!   timeout and duplicate-ack retransmission
//! - **LEDBAT**: congestion window driven by one-way queuing delay
//! - **Blocking stream API**: connections are shared across threads and
//!   waiters park on condition variables
//! - **Async server**: Tokio UDP socket demultiplexing many connections
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use utp_stream::{UtpConfig, UtpServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = UtpConfig::default();
//!     let server = UtpServer::bind_with_config("0.0.0.0:0".parse()?, config).await?;
//!
//!     let conn = server.connect("127.0.0.1:6881".parse()?).await?;
//!     conn.send(b"hello")?;
//!     conn.close();
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod error;
pub mod utp;

// Re-exports for convenience
pub use config::{UtpConfig, MAX_PACKET_SIZE};
pub use error::{MalformedKind, Result, UtpError};
pub use utp::{
    Connection, ConnectionState, ConnectionStats, ConnectionType, PacketSink, UtpContext,
    UtpServer,
};
