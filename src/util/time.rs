//! Injected time source and millisecond timers
//!
//! All managers take `now_ms` explicitly; the `Clock` is only consulted at the
//! edges (background loop, application facade), so tests drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic millisecond time source
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;
}

/// Clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Move time forward
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Deadline tracker updated with explicit timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    start_ms: u64,
    current_ms: u64,
    deadline_ms: u64,
    timeout_ms: u64,
}

impl Timer {
    /// Timer that expires `timeout_ms` after `now_ms`
    pub fn new(now_ms: u64, timeout_ms: u64) -> Self {
        Self {
            start_ms: now_ms,
            current_ms: now_ms,
            deadline_ms: now_ms.saturating_add(timeout_ms),
            timeout_ms,
        }
    }

    /// Timer whose deadline is an absolute timestamp
    pub fn until(now_ms: u64, deadline_ms: u64) -> Self {
        Self::new(now_ms, deadline_ms.saturating_sub(now_ms))
    }

    /// Record the current time; never moves backwards
    pub fn update(&mut self, now_ms: u64) {
        self.current_ms = self.current_ms.max(now_ms);
    }

    /// Restart the countdown from the last observed time
    pub fn reset(&mut self, timeout_ms: u64) {
        self.start_ms = self.current_ms;
        self.timeout_ms = timeout_ms;
        self.deadline_ms = self.current_ms.saturating_add(timeout_ms);
    }

    pub fn update_and_reset(&mut self, now_ms: u64, timeout_ms: u64) {
        self.update(now_ms);
        self.reset(timeout_ms);
    }

    pub fn is_expired(&self) -> bool {
        self.current_ms >= self.deadline_ms
    }

    pub fn not_expired(&self) -> bool {
        !self.is_expired()
    }

    pub fn remaining_ms(&self) -> u64 {
        self.deadline_ms.saturating_sub(self.current_ms)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.current_ms.saturating_sub(self.start_ms)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_shared_between_clones() {
        let clock = MockClock::new(1_000);
        let other = clock.clone();
        clock.advance(250);
        assert_eq!(other.now_ms(), 1_250);
        other.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_timer_expiry() {
        let mut timer = Timer::new(100, 50);
        assert!(timer.not_expired());
        assert_eq!(timer.remaining_ms(), 50);

        timer.update(149);
        assert_eq!(timer.remaining_ms(), 1);
        assert_eq!(timer.elapsed_ms(), 49);

        timer.update(150);
        assert!(timer.is_expired());
        assert_eq!(timer.remaining_ms(), 0);
    }

    #[test]
    fn test_timer_reset_and_monotonic_update() {
        let mut timer = Timer::new(0, 10);
        timer.update(20);
        timer.update(5);
        assert_eq!(timer.current_ms(), 20);

        timer.reset(100);
        assert_eq!(timer.deadline_ms(), 120);
        assert_eq!(timer.elapsed_ms(), 0);

        timer.update_and_reset(50, 0);
        assert!(timer.is_expired());
    }

    #[test]
    fn test_timer_until_past_deadline() {
        let timer = Timer::until(500, 100);
        assert!(timer.is_expired());
        assert_eq!(timer.timeout_ms(), 0);
    }
}
