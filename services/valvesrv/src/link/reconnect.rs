//! Reconnect backoff
//!
//! Exponential delay with optional ±25% jitter, capped at `max_delay_ms`.
//! `max_attempts` of 0 means retry forever, which is how the device link runs.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failures before giving up (0 = never)
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Wait after `failures` consecutive failures (`failures >= 1`)
    pub fn delay_after(&self, failures: u32) -> Duration {
        let steps = failures.saturating_sub(1).min(63) as i32;
        let grown = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(steps);
        let mut ms = grown.min(self.max_delay_ms as f64);

        if self.jitter && ms > 0.0 {
            let spread = ms * 0.25;
            ms = (ms + rand::thread_rng().gen_range(-spread..spread)).max(0.0);
        }
        Duration::from_millis(ms as u64)
    }
}

/// Consecutive-failure count for one connection loop
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// False once `max_attempts` failures in a row have been recorded
    pub fn may_retry(&self) -> bool {
        self.policy.max_attempts == 0 || self.failures < self.policy.max_attempts
    }

    /// Record a failed attempt; returns the wait before the next one
    pub fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_after(self.failures)
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
    }
}
