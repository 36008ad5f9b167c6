//! Peer scoring: decaying penalties, latency and throughput tracking.
//!
//! The score feeds two decisions: whether a peer is banned, and how the
//! request distributor ranks otherwise equal peers. Throughput is also used
//! to size requests so slow peers get small batches.

use crate::penalties::{Penalties, PenaltyReason, Rewards};
use std::time::{Duration, Instant};

/// Responses faster than this earn a reward.
const FAST_RESPONSE_MS: u64 = 500;

/// Peer score with decay and delivery tracking.
#[derive(Debug, Clone)]
pub struct PeerScore {
    /// Accumulated penalty points (0 to MAX_PENALTY).
    penalty: u32,
    /// Last time the penalty changed (decay reference).
    last_penalty_time: Instant,
    /// Latency EMA in milliseconds.
    avg_latency_ms: u64,
    /// Throughput EMA in items per second.
    throughput: f64,
    /// Number of samples behind the EMAs.
    samples: u64,
    /// Successful deliveries.
    delivered_count: u64,
    /// Timeouts and rejected deliveries.
    failed_count: u64,
    /// Accumulated rewards.
    reward_score: i32,
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScore {
    /// Fresh score.
    pub fn new() -> Self {
        Self {
            penalty: 0,
            last_penalty_time: Instant::now(),
            avg_latency_ms: 0,
            throughput: 0.0,
            samples: 0,
            delivered_count: 0,
            failed_count: 0,
            reward_score: 0,
        }
    }

    /// Penalty after decay.
    pub fn current_penalty(&self) -> u32 {
        let minutes_elapsed = self.last_penalty_time.elapsed().as_secs() / 60;
        let decay = (minutes_elapsed as u32).saturating_mul(Penalties::DECAY_PER_MINUTE);
        self.penalty.saturating_sub(decay)
    }

    /// Apply a penalty. Returns `true` when the peer should be banned.
    pub fn apply_penalty(&mut self, reason: PenaltyReason) -> bool {
        self.apply_penalty_amount(reason.penalty())
    }

    /// Apply a raw penalty amount. Returns `true` when the peer should be banned.
    pub fn apply_penalty_amount(&mut self, amount: u32) -> bool {
        let current = self.current_penalty();
        self.penalty = current.saturating_add(amount).min(Penalties::MAX_PENALTY);
        self.last_penalty_time = Instant::now();
        self.should_ban()
    }

    /// Apply a reward, capped at MAX_SCORE.
    pub fn apply_reward(&mut self, amount: i32) {
        self.reward_score = (self.reward_score + amount).min(Rewards::MAX_SCORE);
    }

    /// Record a delivery of `items` items that took `elapsed`.
    ///
    /// Latency and throughput use an EMA with alpha = 1/8.
    pub fn record_delivery(&mut self, items: usize, elapsed: Duration) {
        let latency = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64().max(0.001);
        let rate = items as f64 / secs;

        if self.samples == 0 {
            self.avg_latency_ms = latency;
            self.throughput = rate;
        } else {
            self.avg_latency_ms = (self.avg_latency_ms * 7 + latency) / 8;
            self.throughput = self.throughput * 0.875 + rate * 0.125;
        }
        self.samples += 1;
        self.delivered_count += 1;

        self.apply_reward(Rewards::SUCCESSFUL_DELIVERY);
        if latency < FAST_RESPONSE_MS {
            self.apply_reward(Rewards::FAST_RESPONSE);
        }
    }

    /// Record a failed request.
    pub fn record_failure(&mut self) {
        self.failed_count += 1;
    }

    /// Whether the penalty has crossed the ban threshold.
    pub fn should_ban(&self) -> bool {
        self.current_penalty() >= Penalties::BAN_THRESHOLD
    }

    /// Ranking value in `[0, 1]`; higher is better.
    pub fn priority(&self) -> f64 {
        let latency_factor = if self.samples == 0 {
            0.5
        } else {
            1.0 / (1.0 + (self.avg_latency_ms as f64 / 1000.0))
        };

        let total = self.delivered_count + self.failed_count;
        let reliability_factor = if total == 0 {
            0.5
        } else {
            self.delivered_count as f64 / total as f64
        };

        let penalty_factor = 1.0 - (self.current_penalty() as f64 / Penalties::MAX_PENALTY as f64);

        let reward_factor = if self.reward_score <= 0 {
            0.5
        } else {
            0.5 + (self.reward_score as f64 / Rewards::MAX_SCORE as f64) * 0.5
        };

        (reliability_factor * 0.35
            + latency_factor * 0.30
            + penalty_factor * 0.20
            + reward_factor * 0.15)
            .clamp(0.0, 1.0)
    }

    /// Whether no request to the peer has finished yet.
    pub fn is_untried(&self) -> bool {
        self.delivered_count == 0 && self.failed_count == 0
    }

    /// Estimated items per second, zero when unmeasured.
    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    /// Latency EMA in milliseconds.
    pub fn avg_latency(&self) -> u64 {
        self.avg_latency_ms
    }

    /// Successful deliveries.
    pub fn delivered_count(&self) -> u64 {
        self.delivered_count
    }

    /// Failed requests.
    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }

    /// Reward score.
    pub fn reward_score(&self) -> i32 {
        self.reward_score
    }

    /// Reset to a fresh score.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
