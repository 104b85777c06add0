//! # Reconnect Policy
//!
//! Exponential backoff with bounded jitter and a total retry budget for the feed.
//!
//! `delay(k) = min(base * 2^k, cap)`, plus uniform jitter in `[0, jitter_ratio * delay]`.
//! The budget is exhausted when the consecutive-attempt counter exceeds
//! `max_attempts` or the wall clock since the first attempt exceeds `max_total`.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub max_total: Duration,
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            max_total: Duration::from_secs(3600),
            jitter_ratio: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Pre-jitter delay after `attempt` consecutive failures.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        // 2^63 already saturates any realistic cap
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay including jitter drawn from `rng`.
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_for(attempt);
        let max_jitter = delay.as_secs_f64() * self.jitter_ratio.max(0.0);
        if max_jitter <= 0.0 {
            return delay;
        }
        delay + Duration::from_secs_f64(rng.gen_range(0.0..=max_jitter))
    }
}

/// Why the retry budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    Attempts { attempts: u32 },
    WallClock { elapsed: Duration },
}

/// Consecutive-failure counter plus the wall clock since the first attempt.
#[derive(Debug)]
pub struct RetryBudget {
    policy: ReconnectPolicy,
    attempt: u32,
    started_at: Instant,
}

impl RetryBudget {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            started_at: Instant::now(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called once the connection reaches `Streaming`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Checks the budget before an attempt.
    pub fn check(&self) -> Result<(), BudgetExhausted> {
        let elapsed = self.started_at.elapsed();
        if elapsed > self.policy.max_total {
            return Err(BudgetExhausted::WallClock { elapsed });
        }
        if self.attempt > self.policy.max_attempts {
            return Err(BudgetExhausted::Attempts {
                attempts: self.attempt,
            });
        }
        Ok(())
    }

    /// Records a failed connection and returns how long to wait before the next one.
    pub fn record_failure<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.policy.delay_with_jitter(self.attempt, rng);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}
