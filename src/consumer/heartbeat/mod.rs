//! Group heartbeats
//!
//! [`HeartbeatRequestManager`] decides when the next heartbeat goes out,
//! builds it from the member's state and feeds the response back into the
//! [`MembershipManager`]. It also owns the poll timer: when the application
//! stops polling for longer than `max_poll_interval_ms` the member sends a
//! leave heartbeat and turns stale until the next poll.

mod state;

pub use state::{HeartbeatRequestState, HeartbeatSentFields};

use super::events::BackgroundEventHandler;
use super::membership::{HeartbeatResponseData, MemberState, MembershipFlavor, MembershipManager};
use super::protocol::{Node, ResponseBody};
use super::request::{CoordinatorRequestManager, PollResult, RequestHandler, UnsentRequest};
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, KafkaErrorCode, Result};
use crate::metrics;
use crate::util::Timer;
use tracing::{debug, error, info, trace, warn};

/// Heartbeat interval used until the coordinator sends one
const INITIAL_HEARTBEAT_INTERVAL_MS: u64 = 0;

pub struct HeartbeatRequestManager<F: MembershipFlavor> {
    membership: MembershipManager<F>,
    heartbeat_state: HeartbeatRequestState,
    sent_fields: HeartbeatSentFields<F::Assignment>,
    poll_timer: Timer,
    max_poll_interval_ms: u64,
    background: BackgroundEventHandler,
}

impl<F: MembershipFlavor> HeartbeatRequestManager<F> {
    pub fn new(
        config: &ConsumerConfig,
        membership: MembershipManager<F>,
        background: BackgroundEventHandler,
        now_ms: u64,
    ) -> Self {
        Self {
            membership,
            heartbeat_state: HeartbeatRequestState::new(
                now_ms,
                INITIAL_HEARTBEAT_INTERVAL_MS,
                config.retry_backoff_ms,
                config.retry_backoff_max_ms,
                config.retry_backoff_jitter,
            ),
            sent_fields: HeartbeatSentFields::default(),
            poll_timer: Timer::new(now_ms, config.max_poll_interval_ms),
            max_poll_interval_ms: config.max_poll_interval_ms,
            background,
        }
    }

    pub fn membership(&self) -> &MembershipManager<F> {
        &self.membership
    }

    pub fn membership_mut(&mut self) -> &mut MembershipManager<F> {
        &mut self.membership
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_state.heartbeat_interval_ms()
    }

    pub fn poll(&mut self, coordinator: &mut CoordinatorRequestManager, now_ms: u64) -> PollResult {
        let node = match coordinator.coordinator() {
            Some(node) if !self.membership.should_skip_heartbeat() => node.clone(),
            _ => {
                self.membership.on_heartbeat_request_skipped();
                if let Some(error) = coordinator.get_and_clear_fatal_error() {
                    self.background.add_error(error);
                }
                return PollResult::empty();
            }
        };

        self.poll_timer.update(now_ms);
        if self.poll_timer.is_expired() && !self.membership.is_leaving_group() {
            warn!(
                group_id = %self.membership.group_id(),
                member_id = %self.membership.member_id(),
                max_poll_interval_ms = self.max_poll_interval_ms,
                "Consumer poll timeout has expired. This means the time between subsequent calls \
                 to poll() was longer than the configured max_poll_interval_ms, which typically \
                 implies that the poll loop is spending too much time processing messages. \
                 The member will leave the group and rejoin on the next poll"
            );
            self.membership.transition_to_sending_leave_group(true);
            let request = self.make_heartbeat_request(node, true, now_ms);
            // The leave response is ignored, so nothing would clear the in-flight flag
            self.heartbeat_state.reset();
            self.sent_fields.reset();
            return PollResult::with_request(self.heartbeat_state.heartbeat_interval_ms(), request);
        }

        let heartbeat_now = self.membership.state() == MemberState::Leaving
            || (self.membership.should_heartbeat_now() && !self.heartbeat_state.request_in_flight());
        if !self.heartbeat_state.can_send_request(now_ms) && !heartbeat_now {
            return PollResult::wait(self.heartbeat_state.time_to_next_heartbeat_ms(now_ms));
        }

        let request = self.make_heartbeat_request(node, false, now_ms);
        PollResult::with_request(self.heartbeat_state.heartbeat_interval_ms(), request)
    }

    fn make_heartbeat_request(&mut self, node: Node, ignore_response: bool, now_ms: u64) -> UnsentRequest {
        let body = self.membership.build_heartbeat_request(&mut self.sent_fields);
        trace!(
            member_epoch = self.membership.member_epoch(),
            state = %self.membership.state(),
            "Sending heartbeat"
        );
        self.heartbeat_state.on_send_attempt(now_ms);
        self.membership.on_heartbeat_request_generated();
        metrics::record_heartbeat_sent(F::GROUP_TYPE);
        self.heartbeat_state.reset_timer();
        UnsentRequest::new(body, Some(node), RequestHandler::Heartbeat { ignore_response })
    }

    /// Upper bound on how long the background thread may sleep
    pub fn maximum_time_to_wait(&mut self, coordinator: &CoordinatorRequestManager, now_ms: u64) -> u64 {
        self.poll_timer.update(now_ms);
        if self.poll_timer.is_expired() {
            return 0;
        }
        let poll_bound = self.poll_timer.remaining_ms() / 2;
        if coordinator.coordinator().is_none() || self.membership.should_skip_heartbeat() {
            return poll_bound;
        }
        if self.membership.should_heartbeat_now() && !self.heartbeat_state.request_in_flight() {
            return 0;
        }
        poll_bound.min(self.heartbeat_state.time_to_next_heartbeat_ms(now_ms))
    }

    /// The application polled; restart the poll timer and rejoin if the
    /// member went stale in the meantime
    pub fn reset_poll_timer(&mut self, now_ms: u64) {
        self.poll_timer.update(now_ms);
        if self.poll_timer.is_expired() {
            debug!(
                exceeded_ms = now_ms.saturating_sub(self.poll_timer.deadline_ms()),
                "Poll timer was expired, member rejoins if it went stale"
            );
            self.membership.maybe_rejoin_stale_member();
        }
        self.poll_timer.reset(self.max_poll_interval_ms);
    }

    pub fn handle_response(
        &mut self,
        ignore_response: bool,
        outcome: Result<ResponseBody>,
        coordinator: &mut CoordinatorRequestManager,
        now_ms: u64,
    ) {
        if ignore_response {
            debug!(
                member_id = %self.membership.member_id(),
                "Ignoring response to the leave heartbeat sent after poll timer expiry"
            );
            return;
        }

        let body = match outcome {
            Ok(body) => body,
            Err(error) => {
                self.on_request_failure(error, coordinator, now_ms);
                return;
            }
        };

        match self.membership.parse_heartbeat_response(body) {
            Ok(data) => self.on_response(data, coordinator, now_ms),
            Err(error) => {
                error!(
                    member_id = %self.membership.member_id(),
                    error = %error,
                    "Failed to process heartbeat response"
                );
                self.heartbeat_state.on_failed_attempt(now_ms);
                self.background.add_error(error);
                self.membership.transition_to_fatal();
            }
        }
    }

    fn on_response(
        &mut self,
        data: HeartbeatResponseData<F::Assignment>,
        coordinator: &mut CoordinatorRequestManager,
        now_ms: u64,
    ) {
        let code = data.error();
        if code == KafkaErrorCode::None {
            let interval = u64::try_from(data.heartbeat_interval_ms).unwrap_or(0);
            self.heartbeat_state.update_heartbeat_interval_ms(interval);
            self.heartbeat_state.on_successful_attempt(now_ms);
            self.membership.on_heartbeat_success(data);
            return;
        }

        self.sent_fields.reset();
        self.heartbeat_state.on_failed_attempt(now_ms);
        self.membership.on_heartbeat_failure(code.is_retriable());
        metrics::record_heartbeat_error(F::GROUP_TYPE, code.as_i16());

        let error = ConsumerError::from_code(code, data.error_message.as_deref());
        let member_id = self.membership.member_id().to_string();
        match code {
            KafkaErrorCode::NotCoordinator | KafkaErrorCode::CoordinatorNotAvailable => {
                info!(
                    member_id = %member_id,
                    error = %error,
                    "Heartbeat failed because the coordinator moved or is unavailable, will rediscover"
                );
                coordinator.mark_coordinator_unknown(&error.to_string(), now_ms);
            }
            KafkaErrorCode::CoordinatorLoadInProgress => {
                info!(
                    member_id = %member_id,
                    "Heartbeat failed because the coordinator is still loading, will retry"
                );
            }
            code if code.is_fencing() => {
                info!(
                    member_id = %member_id,
                    member_epoch = self.membership.member_epoch(),
                    error = %error,
                    "Member got fenced, releasing assignment and rejoining"
                );
                self.membership.transition_to_fenced();
                self.heartbeat_state.reset();
            }
            _ => {
                error!(
                    member_id = %member_id,
                    error = %error,
                    "Heartbeat failed with non-recoverable error"
                );
                self.background.add_error(error);
                self.membership.transition_to_fatal();
            }
        }
    }

    fn on_request_failure(
        &mut self,
        error: ConsumerError,
        coordinator: &mut CoordinatorRequestManager,
        now_ms: u64,
    ) {
        self.heartbeat_state.on_failed_attempt(now_ms);
        self.sent_fields.reset();
        if error.is_retriable() {
            debug!(error = %error, "Heartbeat request failed, will retry");
            coordinator.handle_coordinator_disconnect(&error, now_ms);
            self.membership.on_heartbeat_failure(true);
            return;
        }
        error!(error = %error, "Heartbeat request failed with non-retriable error");
        self.membership.on_heartbeat_failure(false);
        self.background.add_error(error);
        self.membership.transition_to_fatal();
    }
}
