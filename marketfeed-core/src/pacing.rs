//! Inter-request pacing for sequential pipelines.
//!
//! Pacing is separate from retry backoff: backoff spaces out attempts at the
//! *same* item, pacing spaces out *different* items so an undocumented rate
//! limit is never reached in the first place.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pacing parameters. Defaults match a conservative per-symbol crawl:
/// 2 s between items, +5 s every 10 items, 10 s after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingPolicy {
    pub base_delay_ms: u64,
    /// Every `cooldown_every` items an extra cooldown is added. 0 disables it.
    pub cooldown_every: usize,
    pub cooldown_ms: u64,
    /// Replaces the base delay after an item failed.
    pub error_delay_ms: u64,
    /// Throttle escalation factor, clamped to 5..=10.
    pub throttle_multiplier: u32,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            cooldown_every: 10,
            cooldown_ms: 5_000,
            error_delay_ms: 10_000,
            throttle_multiplier: 5,
        }
    }
}

impl PacingPolicy {
    /// No waiting at all (tests, dry runs).
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            cooldown_every: 0,
            cooldown_ms: 0,
            error_delay_ms: 0,
            throttle_multiplier: 5,
        }
    }
}

/// Stateful pacer for one sequential run.
#[derive(Debug, Clone)]
pub struct Pacer {
    policy: PacingPolicy,
    previous_failed: bool,
}

impl Pacer {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            previous_failed: false,
        }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// How long to wait before starting item `index` (0-based) of `total`.
    ///
    /// The first item starts immediately. Every `cooldown_every` completed
    /// items the cooldown is added on top.
    pub fn before_each(&mut self, index: usize, total: usize) -> Duration {
        if index == 0 || index >= total {
            self.previous_failed = false;
            return Duration::ZERO;
        }

        let base = if self.previous_failed {
            self.policy.error_delay_ms
        } else {
            self.policy.base_delay_ms
        };
        self.previous_failed = false;

        let mut wait = Duration::from_millis(base);
        if self.policy.cooldown_every > 0 && index % self.policy.cooldown_every == 0 {
            wait += Duration::from_millis(self.policy.cooldown_ms);
        }
        wait
    }

    /// Mark the item just processed as failed; the next wait uses the error delay.
    pub fn record_failure(&mut self) {
        self.previous_failed = true;
    }

    /// A single escalated wait after an explicit throttle signal.
    pub fn on_throttle_signal(&self) -> Duration {
        let factor = self.policy.throttle_multiplier.clamp(5, 10);
        Duration::from_millis(self.policy.base_delay_ms.saturating_mul(factor as u64))
    }

    /// `retry` with its throttle wait raised to the escalated wait, so a 429
    /// answered by a retry still gets it before the next attempt.
    pub fn escalate(&self, retry: RetryPolicy) -> RetryPolicy {
        let escalated = self.on_throttle_signal().as_millis() as u64;
        RetryPolicy {
            throttle_wait_ms: retry.throttle_wait_ms.max(escalated),
            ..retry
        }
    }
}
