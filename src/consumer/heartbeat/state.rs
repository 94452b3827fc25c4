//! Heartbeat timing and the record of fields already sent

use crate::consumer::membership::LocalAssignment;
use crate::consumer::request::RequestState;
use crate::util::Timer;
use std::collections::BTreeSet;

/// When the next heartbeat may go out: the interval timer plus request backoff
#[derive(Debug, Clone)]
pub struct HeartbeatRequestState {
    request_state: RequestState,
    heartbeat_timer: Timer,
    heartbeat_interval_ms: u64,
}

impl HeartbeatRequestState {
    pub fn new(
        now_ms: u64,
        heartbeat_interval_ms: u64,
        retry_backoff_ms: u64,
        retry_backoff_max_ms: u64,
        jitter: f64,
    ) -> Self {
        Self {
            request_state: RequestState::new(
                "heartbeat",
                retry_backoff_ms,
                retry_backoff_max_ms,
                jitter,
            ),
            heartbeat_timer: Timer::new(now_ms, heartbeat_interval_ms),
            heartbeat_interval_ms,
        }
    }

    /// Interval elapsed, nothing in flight and backoff expired
    pub fn can_send_request(&mut self, now_ms: u64) -> bool {
        self.heartbeat_timer.update(now_ms);
        self.heartbeat_timer.is_expired() && self.request_state.can_send_request(now_ms)
    }

    /// Remaining interval, or remaining backoff once the interval has elapsed
    pub fn time_to_next_heartbeat_ms(&mut self, now_ms: u64) -> u64 {
        self.heartbeat_timer.update(now_ms);
        if self.heartbeat_timer.is_expired() {
            return self.request_state.remaining_backoff_ms(now_ms);
        }
        self.heartbeat_timer.remaining_ms()
    }

    /// Restart the interval countdown after sending
    pub fn reset_timer(&mut self) {
        self.heartbeat_timer.reset(self.heartbeat_interval_ms);
    }

    pub fn update_heartbeat_interval_ms(&mut self, heartbeat_interval_ms: u64) {
        if self.heartbeat_interval_ms == heartbeat_interval_ms {
            return;
        }
        self.heartbeat_interval_ms = heartbeat_interval_ms;
        self.heartbeat_timer.reset(heartbeat_interval_ms);
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    pub fn on_send_attempt(&mut self, now_ms: u64) {
        self.request_state.on_send_attempt(now_ms);
    }

    pub fn on_successful_attempt(&mut self, now_ms: u64) {
        self.request_state.on_successful_attempt(now_ms);
    }

    /// A failed heartbeat may be retried without waiting for the interval,
    /// subject to backoff
    pub fn on_failed_attempt(&mut self, now_ms: u64) {
        self.heartbeat_timer.update(now_ms);
        self.heartbeat_timer.reset(0);
        self.request_state.on_failed_attempt(now_ms);
    }

    /// Clear backoff and attempts so the next heartbeat can go out immediately
    pub fn reset(&mut self) {
        self.request_state.reset();
        self.heartbeat_timer.reset(0);
    }

    pub fn request_in_flight(&self) -> bool {
        self.request_state.request_in_flight()
    }

    pub fn remaining_backoff_ms(&self, now_ms: u64) -> u64 {
        self.request_state.remaining_backoff_ms(now_ms)
    }
}

/// Fields included in the last heartbeat, so unchanged ones can be omitted
#[derive(Debug, Clone)]
pub struct HeartbeatSentFields<A> {
    pub rebalance_timeout_ms: Option<i32>,
    pub subscribed_topics: Option<BTreeSet<String>>,
    pub server_assignor: Option<String>,
    pub local_assignment: Option<LocalAssignment<A>>,
}

impl<A> Default for HeartbeatSentFields<A> {
    fn default() -> Self {
        Self {
            rebalance_timeout_ms: None,
            subscribed_topics: None,
            server_assignor: None,
            local_assignment: None,
        }
    }
}

impl<A> HeartbeatSentFields<A> {
    /// Forget everything so the next heartbeat carries the full state
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
