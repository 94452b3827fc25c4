//! Exponential backoff with jitter

use rand::Rng;

/// Exponential backoff: `initial * multiplier^attempts`, capped at `max_ms`,
/// randomized by `±jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_ms: u64,
    multiplier: u32,
    max_ms: u64,
    jitter: f64,
    exp_max: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, multiplier: u32, max_ms: u64, jitter: f64) -> Self {
        let exp_max = if max_ms > initial_ms && initial_ms > 0 && multiplier > 1 {
            ((max_ms as f64) / (initial_ms as f64)).ln() / (multiplier as f64).ln()
        } else {
            0.0
        };
        Self {
            initial_ms,
            multiplier,
            max_ms,
            jitter,
            exp_max,
        }
    }

    /// Backoff for the given number of failed attempts
    pub fn backoff(&self, attempts: u32) -> u64 {
        if self.exp_max == 0.0 {
            return self.initial_ms.min(self.max_ms);
        }
        let exp = (attempts as f64).min(self.exp_max);
        let term = self.initial_ms as f64 * (self.multiplier as f64).powf(exp);
        let factor = if self.jitter > f64::EPSILON {
            rand::thread_rng().gen_range((1.0 - self.jitter)..(1.0 + self.jitter))
        } else {
            1.0
        };
        let value = (factor * term).round() as u64;
        value.min(self.max_ms)
    }

    pub fn initial_ms(&self) -> u64 {
        self.initial_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }
}
