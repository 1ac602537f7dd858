//! Send-side window
//!
//! Tracks packets that were sent but not yet acknowledged, the congestion
//! window budget they consume and the peer's advertised receive window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::packet::{seq_less_or_equal, Header, PacketType, SelectiveAck};
use crate::config::UtpConfig;

/// A transmitted packet awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct UnackedPacket {
    pub seq_nr: u16,

    /// Payload (empty for FIN)
    pub payload: Bytes,

    /// Time of the last (re)transmission
    pub sent_at: Instant,

    /// Number of retransmissions
    pub retransmissions: u32,
}

/// What an incoming header acknowledged
#[derive(Debug, Default, Clone)]
pub struct AckOutcome {
    pub packets_acked: usize,
    pub bytes_acked: usize,

    /// Round trips measured on packets that were never resent
    pub rtt_samples: Vec<Duration>,

    /// The cumulative ack repeated while data was in flight
    pub duplicate_ack: bool,
}

/// In-flight tracker and congestion window
#[derive(Debug)]
pub struct RemoteWindow {
    /// Unacknowledged packets in send order
    in_flight: VecDeque<UnackedPacket>,

    /// Bytes currently in flight
    bytes_in_flight: usize,

    /// Congestion window (bytes)
    max_window: f64,

    min_window: f64,

    window_ceiling: f64,

    /// Peer's advertised receive window
    peer_window: u32,

    /// Last cumulative ack seen
    last_ack_nr: Option<u16>,

    duplicate_acks: u32,

    duplicate_ack_threshold: u32,

    /// Oldest packet should be resent without waiting for the timeout
    fast_retransmit: bool,
}

impl RemoteWindow {
    pub fn new(config: &UtpConfig) -> Self {
        Self {
            in_flight: VecDeque::new(),
            bytes_in_flight: 0,
            max_window: config.initial_window as f64,
            min_window: config.min_window as f64,
            window_ceiling: config.max_window as f64,
            peer_window: config.recv_window,
            last_ack_nr: None,
            duplicate_acks: 0,
            duplicate_ack_threshold: config.duplicate_ack_threshold.max(1),
            fast_retransmit: false,
        }
    }

    /// Record a newly transmitted packet
    pub fn add_packet(&mut self, payload: Bytes, seq_nr: u16, sent_at: Instant) {
        self.bytes_in_flight += payload.len();
        self.in_flight.push_back(UnackedPacket {
            seq_nr,
            payload,
            sent_at,
            retransmissions: 0,
        });
    }

    /// Process the acknowledgment fields of an incoming header
    pub fn packet_received(
        &mut self,
        header: &Header,
        selective_ack: Option<&SelectiveAck>,
        now: Instant,
    ) -> AckOutcome {
        let previous_window = std::mem::replace(&mut self.peer_window, header.wnd_size);

        let mut outcome = AckOutcome::default();
        let ack_nr = header.ack_nr;

        // Cumulative: everything up to and including ack_nr
        while let Some(front) = self.in_flight.front() {
            if !seq_less_or_equal(front.seq_nr, ack_nr) {
                break;
            }
            if let Some(pkt) = self.in_flight.pop_front() {
                self.acknowledge(pkt, now, &mut outcome);
            }
        }
        let advanced = outcome.packets_acked > 0;

        if let Some(sack) = selective_ack {
            let base = ack_nr.wrapping_add(2);
            for offset in sack.acked_offsets() {
                let seq = base.wrapping_add(offset);
                if let Some(pos) = self.in_flight.iter().position(|p| p.seq_nr == seq) {
                    if let Some(pkt) = self.in_flight.remove(pos) {
                        self.acknowledge(pkt, now, &mut outcome);
                    }
                }
            }
        }

        // Only bare acks count: data packets legitimately repeat ack_nr and a
        // grown window is an update. Selectively acked packets do not matter.
        let duplicate = header.packet_type == PacketType::State
            && !advanced
            && !self.in_flight.is_empty()
            && self.last_ack_nr == Some(ack_nr)
            && header.wnd_size <= previous_window;
        if duplicate {
            outcome.duplicate_ack = true;
            self.duplicate_acks += 1;
            if self.duplicate_acks == self.duplicate_ack_threshold {
                self.fast_retransmit = true;
            }
        } else if advanced {
            self.duplicate_acks = 0;
        }
        self.last_ack_nr = Some(ack_nr);

        outcome
    }

    fn acknowledge(&mut self, pkt: UnackedPacket, now: Instant, outcome: &mut AckOutcome) {
        self.bytes_in_flight -= pkt.payload.len();
        outcome.packets_acked += 1;
        outcome.bytes_acked += pkt.payload.len();
        if pkt.retransmissions == 0 {
            outcome.rtt_samples.push(now.saturating_duration_since(pkt.sent_at));
        }
    }

    /// Bytes that may be sent right now
    pub fn available_space(&self) -> u32 {
        let window = (self.max_window as u64).min(self.peer_window as u64);
        window.saturating_sub(self.bytes_in_flight as u64) as u32
    }

    /// In-flight bytes relative to the congestion window, in [0, 1]
    pub fn window_usage_factor(&self) -> f64 {
        (self.bytes_in_flight as f64 / self.max_window).clamp(0.0, 1.0)
    }

    /// Grow or shrink the congestion window
    pub fn update_window_size(&mut self, scaled_gain: f64) {
        if !scaled_gain.is_finite() {
            return;
        }
        self.max_window = (self.max_window + scaled_gain).clamp(self.min_window, self.window_ceiling);
    }

    /// No ack arrived in time: multiplicative decrease
    pub fn timeout(&mut self) {
        self.max_window = (self.max_window / 2.0).max(self.min_window);
        self.duplicate_acks = 0;
        self.fast_retransmit = false;
    }

    pub fn all_packets_acked(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn oldest_unacked(&self) -> Option<&UnackedPacket> {
        self.in_flight.front()
    }

    /// Stamp the oldest packet as resent
    pub fn mark_retransmitted(&mut self, seq_nr: u16, now: Instant) {
        if let Some(pkt) = self.in_flight.iter_mut().find(|p| p.seq_nr == seq_nr) {
            pkt.sent_at = now;
            pkt.retransmissions += 1;
        }
    }

    /// Consume a pending fast retransmit request
    pub fn take_fast_retransmit(&mut self) -> bool {
        std::mem::take(&mut self.fast_retransmit)
    }

    pub fn window_size(&self) -> u32 {
        self.max_window as u32
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Let `bytes` through a closed peer window so its next ack can reopen it
    pub fn open_peer_window(&mut self, bytes: u32) {
        self.peer_window = self.peer_window.max(bytes);
    }
}
