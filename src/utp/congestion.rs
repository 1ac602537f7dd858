//! LEDBAT Congestion Control (BEP 29)
//!
//! This module implements the Low Extra Delay Background Transport (LEDBAT)
//! control law used by uTP, plus the classic smoothed RTT estimator that
//! drives the retransmission timeout. LEDBAT is designed to yield to other
//! traffic by keeping the queuing delay it causes near a fixed target.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::UtpConfig;

/// Rolling minimum over the one-way delay samples of the last few minutes
#[derive(Debug, Clone)]
struct DelayHistory {
    /// (receive time, delay) with delays strictly increasing front to back
    minima: VecDeque<(Instant, u32)>,
    /// Duration to keep samples
    window_duration: Duration,
}

impl DelayHistory {
    fn new(window_duration: Duration) -> Self {
        Self {
            minima: VecDeque::new(),
            window_duration,
        }
    }

    fn add_sample(&mut self, now: Instant, delay_us: u32) {
        // A newer, smaller sample outlives every larger one before it
        while let Some(&(_, d)) = self.minima.back() {
            if d >= delay_us {
                self.minima.pop_back();
            } else {
                break;
            }
        }
        self.minima.push_back((now, delay_us));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window_duration) else {
            return;
        };
        while let Some(&(ts, _)) = self.minima.front() {
            if ts < cutoff {
                self.minima.pop_front();
            } else {
                break;
            }
        }
    }

    fn min(&self) -> Option<u32> {
        self.minima.front().map(|&(_, d)| d)
    }
}

/// One-way delay tracker and LEDBAT gain computation
#[derive(Debug)]
pub struct LedbatController {
    /// Base delay history (minimum delays over the history window)
    base_delay_history: DelayHistory,

    /// Most recent delay sample
    current_delay_us: Option<u32>,

    /// Target queuing delay (microseconds)
    target_delay_us: u32,

    /// Largest window change per application of the gain (bytes)
    max_increase: u32,
}

impl LedbatController {
    pub fn new(config: &UtpConfig) -> Self {
        Self {
            base_delay_history: DelayHistory::new(config.delay_history()),
            current_delay_us: None,
            target_delay_us: config.target_delay_us.max(1),
            max_increase: config.max_cwnd_increase_per_rtt,
        }
    }

    /// Record the peer's latest `timestamp_difference` sample
    ///
    /// A zero sample means the peer has not measured anything yet.
    pub fn on_delay_sample(&mut self, now: Instant, delay_us: u32) {
        if delay_us == 0 {
            return;
        }
        self.base_delay_history.add_sample(now, delay_us);
        self.current_delay_us = Some(delay_us);
    }

    /// Minimum delay in the history window: the no-queuing floor
    pub fn base_delay_us(&self) -> Option<u32> {
        self.base_delay_history.min()
    }

    /// Queuing delay we are currently causing
    pub fn our_delay_us(&self) -> Option<u32> {
        let current = self.current_delay_us?;
        let base = self.base_delay_us()?;
        Some(current.saturating_sub(base))
    }

    /// Signed distance from the target, normalized by the target
    ///
    /// Positive while queuing delay is below target.
    pub fn delay_factor(&self) -> f64 {
        match self.our_delay_us() {
            Some(our_delay) => {
                let off_target = self.target_delay_us as f64 - our_delay as f64;
                off_target / self.target_delay_us as f64
            }
            None => 0.0,
        }
    }

    /// Bytes to add to (or remove from) the congestion window
    pub fn gain(&self, window_usage_factor: f64) -> f64 {
        self.max_increase as f64 * self.delay_factor() * window_usage_factor.clamp(0.0, 1.0)
    }

    pub fn target_delay_us(&self) -> u32 {
        self.target_delay_us
    }
}

/// Jacobson/Karels smoothed RTT and the derived retransmission timeout
#[derive(Debug, Clone)]
pub struct RttEstimator {
    rtt_us: i64,
    rtt_var_us: i64,
    timeout: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
}

impl RttEstimator {
    pub fn new(config: &UtpConfig) -> Self {
        Self {
            rtt_us: config.initial_rtt().as_micros() as i64,
            rtt_var_us: 0,
            timeout: config.initial_timeout(),
            min_timeout: config.min_timeout(),
            max_timeout: config.max_timeout(),
        }
    }

    /// Fold one round-trip sample into the estimate
    pub fn update(&mut self, sample: Duration) {
        let sample_us = sample.as_micros().min(i64::MAX as u128) as i64;

        // RTTVAR += (|SRTT - sample| - RTTVAR) / 4
        // SRTT += (sample - SRTT) / 8
        let delta = self.rtt_us - sample_us;
        self.rtt_var_us += (delta.abs() - self.rtt_var_us) / 4;
        self.rtt_us += (sample_us - self.rtt_us) / 8;

        let rto = Duration::from_micros((self.rtt_us + 4 * self.rtt_var_us).max(0) as u64);
        self.timeout = rto.clamp(self.min_timeout, self.max_timeout);
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_us.max(0) as u64)
    }

    pub fn rtt_var(&self) -> Duration {
        Duration::from_micros(self.rtt_var_us.max(0) as u64)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
