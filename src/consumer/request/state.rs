//! Retry and backoff bookkeeping shared by every request manager

use crate::util::ExponentialBackoff;
use tracing::trace;

const RETRY_BACKOFF_EXP_BASE: u32 = 2;

/// Tracks whether a request may be sent: at most one in flight, and after a
/// response the next send waits out the current backoff
#[derive(Debug, Clone)]
pub struct RequestState {
    owner: &'static str,
    backoff: ExponentialBackoff,
    last_sent_ms: Option<u64>,
    last_received_ms: Option<u64>,
    num_attempts: u32,
    backoff_ms: u64,
    request_in_flight: bool,
}

impl RequestState {
    pub fn new(owner: &'static str, retry_backoff_ms: u64, retry_backoff_max_ms: u64, jitter: f64) -> Self {
        Self {
            owner,
            backoff: ExponentialBackoff::new(
                retry_backoff_ms,
                RETRY_BACKOFF_EXP_BASE,
                retry_backoff_max_ms,
                jitter,
            ),
            last_sent_ms: None,
            last_received_ms: None,
            num_attempts: 0,
            backoff_ms: retry_backoff_ms,
            request_in_flight: false,
        }
    }

    /// Forget every attempt, as if no request had ever been sent
    pub fn reset(&mut self) {
        self.last_sent_ms = None;
        self.last_received_ms = None;
        self.num_attempts = 0;
        self.backoff_ms = self.backoff.initial_ms();
        self.request_in_flight = false;
    }

    pub fn can_send_request(&self, now_ms: u64) -> bool {
        if self.request_in_flight {
            trace!(owner = self.owner, "Request already in flight");
            return false;
        }
        match self.last_received_ms {
            None => true,
            Some(_) => self.request_backoff_expired(now_ms),
        }
    }

    pub fn request_in_flight(&self) -> bool {
        self.request_in_flight
    }

    pub fn on_send_attempt(&mut self, now_ms: u64) {
        self.last_sent_ms = Some(now_ms);
        self.request_in_flight = true;
    }

    /// Response received; the next backoff drops back to the base value
    pub fn on_successful_attempt(&mut self, now_ms: u64) {
        self.last_received_ms = Some(now_ms);
        self.backoff_ms = self.backoff.backoff(0);
        self.num_attempts = 0;
        self.request_in_flight = false;
    }

    /// Failure received; the backoff grows with each consecutive failure
    pub fn on_failed_attempt(&mut self, now_ms: u64) {
        self.last_received_ms = Some(now_ms);
        self.backoff_ms = self.backoff.backoff(self.num_attempts);
        self.num_attempts += 1;
        self.request_in_flight = false;
    }

    pub fn request_backoff_expired(&self, now_ms: u64) -> bool {
        self.remaining_backoff_ms(now_ms) == 0
    }

    pub fn remaining_backoff_ms(&self, now_ms: u64) -> u64 {
        match self.last_received_ms {
            Some(received) => self
                .backoff_ms
                .saturating_sub(now_ms.saturating_sub(received)),
            None => 0,
        }
    }

    pub fn num_attempts(&self) -> u32 {
        self.num_attempts
    }

    pub fn last_sent_ms(&self) -> Option<u64> {
        self.last_sent_ms
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }
}
