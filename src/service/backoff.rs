use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectPolicy;

const MULTIPLIER: f64 = 2.0;
const JITTER: f64 = 0.2;

/// Capped exponential backoff with multiplicative jitter.
///
/// Every delay handed out lies in `[min, max]`, jitter included.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            min: policy.min_delay,
            max: policy.max_delay,
            max_attempts: policy.max_attempts,
            attempts: 0,
            current: policy.min_delay,
        }
    }

    /// `None` once `max_attempts` delays have been handed out since the last reset.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base = self.current;
        self.current = base.mul_f64(MULTIPLIER).min(self.max);

        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER..=JITTER);
        Some(base.mul_f64(factor).clamp(self.min, self.max))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.min;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
