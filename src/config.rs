//! Engine configuration
//!
//! This module contains all tunables of the uTP engine: congestion control
//! targets, window and buffer sizes, MTU bounds and the timer cadence used
//! by the server.

use crate::error::{UtpError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest payload a single packet may carry
pub const MAX_PACKET_SIZE: u32 = 1400;

/// uTP engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtpConfig {
    /// Attach a selective ACK extension when packets arrive out of order
    #[serde(default = "default_true")]
    pub enable_sack: bool,

    /// LEDBAT queuing delay target in microseconds (default: 100,000 = 100ms)
    #[serde(default = "default_target_delay")]
    pub target_delay_us: u32,

    /// Largest congestion window change applied per packet, in bytes
    #[serde(default = "default_max_cwnd_increase")]
    pub max_cwnd_increase_per_rtt: u32,

    /// Initial congestion window in bytes
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,

    /// Congestion window floor in bytes (one minimum-sized packet)
    #[serde(default = "default_min_window")]
    pub min_window: u32,

    /// Congestion window ceiling in bytes (default: 1MB)
    #[serde(default = "default_buffer_size_u32")]
    pub max_window: u32,

    /// Receive buffer size advertised to the peer (default: 1MB)
    #[serde(default = "default_buffer_size_u32")]
    pub recv_window: u32,

    /// Capacity of the unsent output buffer (default: 1MB)
    #[serde(default = "default_send_buffer")]
    pub send_buffer_size: usize,

    /// Payload size used until the first timeout
    #[serde(default = "default_packet_size")]
    pub initial_packet_size: u32,

    /// Payload size after a timeout
    #[serde(default = "default_min_packet_size")]
    pub min_packet_size: u32,

    /// Round trip estimate before any sample (ms)
    #[serde(default = "default_initial_rtt")]
    pub initial_rtt_ms: u64,

    /// Retransmission timeout before any sample (ms)
    #[serde(default = "default_initial_timeout")]
    pub initial_timeout_ms: u64,

    /// Lower bound for the adaptive timeout (ms)
    #[serde(default = "default_min_timeout")]
    pub min_timeout_ms: u64,

    /// Upper bound for the adaptive timeout (ms)
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,

    /// How long one-way delay samples stay in the base delay history (seconds)
    #[serde(default = "default_delay_history")]
    pub delay_history_secs: u64,

    /// Duplicate ACKs that trigger a fast retransmit
    #[serde(default = "default_duplicate_ack_threshold")]
    pub duplicate_ack_threshold: u32,

    /// SYN resends before an outgoing connection gives up
    #[serde(default = "default_max_syn_retries")]
    pub max_syn_retries: u32,

    /// Server tick driving `check_timeout` (ms)
    #[serde(default = "default_check_interval")]
    pub timeout_check_interval_ms: u64,

    /// How long `UtpServer::connect` waits for the handshake (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Incoming connections queued until accepted
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,
}

fn default_true() -> bool {
    true
}

fn default_target_delay() -> u32 {
    100_000 // 100ms
}

fn default_max_cwnd_increase() -> u32 {
    3000
}

fn default_initial_window() -> u32 {
    3000
}

fn default_min_window() -> u32 {
    150
}

fn default_buffer_size_u32() -> u32 {
    1024 * 1024 // 1MB
}

fn default_send_buffer() -> usize {
    1024 * 1024
}

fn default_packet_size() -> u32 {
    MAX_PACKET_SIZE
}

fn default_min_packet_size() -> u32 {
    150
}

fn default_initial_rtt() -> u64 {
    100
}

fn default_initial_timeout() -> u64 {
    1000
}

fn default_min_timeout() -> u64 {
    50
}

fn default_max_timeout() -> u64 {
    500
}

fn default_delay_history() -> u64 {
    120
}

fn default_duplicate_ack_threshold() -> u32 {
    3
}

fn default_max_syn_retries() -> u32 {
    5
}

fn default_check_interval() -> u64 {
    250
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_accept_backlog() -> usize {
    64
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            enable_sack: true,
            target_delay_us: default_target_delay(),
            max_cwnd_increase_per_rtt: default_max_cwnd_increase(),
            initial_window: default_initial_window(),
            min_window: default_min_window(),
            max_window: default_buffer_size_u32(),
            recv_window: default_buffer_size_u32(),
            send_buffer_size: default_send_buffer(),
            initial_packet_size: default_packet_size(),
            min_packet_size: default_min_packet_size(),
            initial_rtt_ms: default_initial_rtt(),
            initial_timeout_ms: default_initial_timeout(),
            min_timeout_ms: default_min_timeout(),
            max_timeout_ms: default_max_timeout(),
            delay_history_secs: default_delay_history(),
            duplicate_ack_threshold: default_duplicate_ack_threshold(),
            max_syn_retries: default_max_syn_retries(),
            timeout_check_interval_ms: default_check_interval(),
            connect_timeout_secs: default_connect_timeout(),
            accept_backlog: default_accept_backlog(),
        }
    }
}

impl UtpConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the selective ACK extension
    pub fn enable_sack(mut self, enabled: bool) -> Self {
        self.enable_sack = enabled;
        self
    }

    /// Set the LEDBAT delay target
    pub fn target_delay(mut self, target: Duration) -> Self {
        self.target_delay_us = target.as_micros().min(u32::MAX as u128) as u32;
        self
    }

    /// Set the advertised receive window
    pub fn recv_window(mut self, bytes: u32) -> Self {
        self.recv_window = bytes;
        self
    }

    /// Set initial and bounding congestion windows
    pub fn window_bounds(mut self, min: u32, initial: u32, max: u32) -> Self {
        self.min_window = min;
        self.initial_window = initial;
        self.max_window = max;
        self
    }

    /// Set the output buffer capacity
    pub fn send_buffer_size(mut self, bytes: usize) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    /// Set the payload size bounds
    pub fn packet_size(mut self, min: u32, initial: u32) -> Self {
        self.min_packet_size = min;
        self.initial_packet_size = initial;
        self
    }

    /// Set the adaptive timeout bounds
    pub fn timeout_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout_ms = min.as_millis() as u64;
        self.max_timeout_ms = max.as_millis() as u64;
        self
    }

    /// Set the server timer cadence
    pub fn timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the handshake deadline used by the server
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn delay_history(&self) -> Duration {
        Duration::from_secs(self.delay_history_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.target_delay_us == 0 {
            return Err(UtpError::invalid_input("target_delay_us", "Must be at least 1"));
        }

        if self.min_window == 0 {
            return Err(UtpError::invalid_input("min_window", "Must be at least 1"));
        }

        if self.min_window > self.initial_window || self.initial_window > self.max_window {
            return Err(UtpError::invalid_input(
                "initial_window",
                format!(
                    "Must satisfy min_window ({}) <= initial_window ({}) <= max_window ({})",
                    self.min_window, self.initial_window, self.max_window
                ),
            ));
        }

        if self.recv_window == 0 {
            return Err(UtpError::invalid_input("recv_window", "Must be at least 1"));
        }

        if self.send_buffer_size == 0 {
            return Err(UtpError::invalid_input("send_buffer_size", "Must be at least 1"));
        }

        if self.min_packet_size == 0 || self.min_packet_size > self.initial_packet_size {
            return Err(UtpError::invalid_input(
                "min_packet_size",
                "Must be non-zero and <= initial_packet_size",
            ));
        }

        if self.initial_packet_size > MAX_PACKET_SIZE {
            return Err(UtpError::invalid_input(
                "initial_packet_size",
                format!("Must be <= {}", MAX_PACKET_SIZE),
            ));
        }

        if self.min_timeout_ms > self.max_timeout_ms {
            return Err(UtpError::invalid_input(
                "min_timeout_ms",
                "Must be <= max_timeout_ms",
            ));
        }

        if self.timeout_check_interval_ms == 0 {
            return Err(UtpError::invalid_input(
                "timeout_check_interval_ms",
                "Must be at least 1",
            ));
        }

        if self.accept_backlog == 0 {
            return Err(UtpError::invalid_input("accept_backlog", "Must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UtpConfig::default();
        assert!(config.enable_sack);
        assert_eq!(config.target_delay_us, 100_000);
        assert_eq!(config.initial_packet_size, 1400);
        assert_eq!(config.max_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = UtpConfig::new()
            .enable_sack(false)
            .recv_window(64 * 1024)
            .window_bounds(300, 6000, 500_000)
            .timeout_bounds(Duration::from_millis(20), Duration::from_millis(400));

        assert!(!config.enable_sack);
        assert_eq!(config.recv_window, 64 * 1024);
        assert_eq!(config.initial_window, 6000);
        assert_eq!(config.min_timeout_ms, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_window_bounds() {
        let config = UtpConfig::new().window_bounds(5000, 3000, 1_000_000);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, UtpError::InvalidInput { field: "initial_window", .. }));
    }

    #[test]
    fn test_invalid_packet_size() {
        assert!(UtpConfig::new().packet_size(0, 1400).validate().is_err());
        assert!(UtpConfig::new().packet_size(150, 9000).validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: UtpConfig =
            serde_json::from_str(r#"{"enable_sack": false, "max_timeout_ms": 800}"#).unwrap();
        assert!(!config.enable_sack);
        assert_eq!(config.max_timeout_ms, 800);
        assert_eq!(config.recv_window, 1024 * 1024);
        assert_eq!(config.min_packet_size, 150);
    }
}
