//! Reconnection backoff policy

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff for broker reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt (default: 3s)
    pub base_delay: Duration,
    /// Upper bound on any delay (default: 30s)
    pub max_delay: Duration,
    /// Attempts before going dormant (default: 20)
    pub max_attempts: u32,
    /// Add up to 25% random jitter (default: false)
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }

    /// Delay before attempt number `attempt` (1-based)
    ///
    /// `min(base × 2^(attempt-1), max)`, plus jitter when enabled. Jitter
    /// never pushes the delay above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return delay;
        }

        let max_jitter = delay.as_secs_f64() * 0.25;
        let jitter = rand::thread_rng().gen_range(0.0..=max_jitter);
        (delay + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` failures
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Observable reconnect progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectState {
    /// Failed attempts since the last successful connect
    pub attempt_count: u32,
    /// Delay scheduled for the next attempt, if one is pending
    pub next_delay: Option<Duration>,
    pub is_reconnecting: bool,
}
