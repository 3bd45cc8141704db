use crate::config::types::RetryConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Exponential backoff with proportional jitter.
///
/// The n-th delay is `initial * 2^(n-1)` capped at `max`, then moved by up to
/// `jitter * delay` in either direction.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    max_attempts: u32,
    attempts: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts.max(1),
            attempts: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Failed attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }

        let exponent = (self.attempts - 1).min(31);
        let base = self
            .initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        if self.jitter == 0.0 || base.is_zero() {
            return Some(base);
        }

        let spread = self.rng.gen_range(-self.jitter..=self.jitter);
        Some(base.mul_f64(1.0 + spread))
    }
}
