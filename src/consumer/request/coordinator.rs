//! Group coordinator discovery
//!
//! Sends `FindCoordinator` until a coordinator is known and tracks how long
//! the member has been without one. A non-retriable discovery failure is kept
//! as a fatal error that the heartbeat manager surfaces once.

use super::state::RequestState;
use super::{PollResult, RequestHandler, UnsentRequest};
use crate::config::ConsumerConfig;
use crate::consumer::protocol::{FindCoordinatorRequest, Node, RequestBody, ResponseBody};
use crate::error::{ConsumerError, KafkaErrorCode, Result};
use crate::metrics;
use tracing::{debug, info, warn};

const DISCONNECT_LOG_INTERVAL_MS: u64 = 60_000;

pub struct CoordinatorRequestManager {
    group_id: String,
    request_state: RequestState,
    coordinator: Option<Node>,
    fatal_error: Option<ConsumerError>,
    time_marked_unknown_ms: Option<u64>,
    total_disconnected_min: u64,
}

impl CoordinatorRequestManager {
    pub fn new(config: &ConsumerConfig) -> Self {
        Self {
            group_id: config.group_id.clone(),
            request_state: RequestState::new(
                "coordinator",
                config.retry_backoff_ms,
                config.retry_backoff_max_ms,
                config.retry_backoff_jitter,
            ),
            coordinator: None,
            fatal_error: None,
            time_marked_unknown_ms: None,
            total_disconnected_min: 0,
        }
    }

    /// Nothing to do while a coordinator is known; otherwise one lookup per backoff window
    pub fn poll(&mut self, now_ms: u64) -> PollResult {
        if self.coordinator.is_some() {
            return PollResult::empty();
        }

        if self.request_state.can_send_request(now_ms) {
            self.request_state.on_send_attempt(now_ms);
            debug!(group_id = %self.group_id, "Sending FindCoordinator request");
            let request = UnsentRequest::new(
                RequestBody::FindCoordinator(FindCoordinatorRequest {
                    key: self.group_id.clone(),
                }),
                None,
                RequestHandler::FindCoordinator,
            );
            return PollResult::with_request(0, request);
        }

        PollResult::wait(self.request_state.remaining_backoff_ms(now_ms))
    }

    pub fn handle_response(&mut self, outcome: Result<ResponseBody>, now_ms: u64) {
        let response = match outcome {
            Ok(ResponseBody::FindCoordinator(response)) => response,
            Ok(other) => {
                let error = ConsumerError::illegal_state(
                    "FindCoordinator",
                    format!("unexpected {} response", other.api_name()),
                );
                self.on_failed_response(error, now_ms);
                return;
            }
            Err(error) => {
                self.on_failed_response(error, now_ms);
                return;
            }
        };

        let code = KafkaErrorCode::from_i16(response.error_code);
        match (code, response.node) {
            (KafkaErrorCode::None, Some(node)) => self.on_response(node, now_ms),
            (KafkaErrorCode::None, None) => {
                let error = ConsumerError::from_code(
                    KafkaErrorCode::CoordinatorNotAvailable,
                    Some("FindCoordinator response carried no coordinator"),
                );
                self.on_failed_response(error, now_ms);
            }
            (code, _) => {
                let error = ConsumerError::from_code(code, response.error_message.as_deref());
                self.on_failed_response(error, now_ms);
            }
        }
    }

    fn on_response(&mut self, node: Node, now_ms: u64) {
        // Separate connection id so coordinator traffic does not share the
        // broker's data connection
        let coordinator_id = i32::MAX - node.id;
        let coordinator = Node {
            id: coordinator_id,
            ..node
        };
        info!(
            group_id = %self.group_id,
            coordinator = %coordinator,
            "Discovered group coordinator"
        );
        metrics::record_coordinator_discovered();
        self.coordinator = Some(coordinator);
        self.fatal_error = None;
        self.request_state.on_successful_attempt(now_ms);
    }

    fn on_failed_response(&mut self, error: ConsumerError, now_ms: u64) {
        self.request_state.on_failed_attempt(now_ms);
        self.mark_coordinator_unknown("FindCoordinator failed", now_ms);

        if error.is_retriable() {
            debug!(group_id = %self.group_id, error = %error, "FindCoordinator request failed, will retry");
            return;
        }

        warn!(group_id = %self.group_id, error = %error, "FindCoordinator request failed due to fatal error");
        self.fatal_error = Some(error);
    }

    /// Forget the current coordinator so the next poll rediscovers it
    pub fn mark_coordinator_unknown(&mut self, cause: &str, now_ms: u64) {
        if let Some(coordinator) = self.coordinator.take() {
            info!(
                group_id = %self.group_id,
                coordinator = %coordinator,
                cause,
                "Group coordinator is unavailable or invalid, will attempt rediscovery"
            );
            self.time_marked_unknown_ms = Some(now_ms);
            self.total_disconnected_min = 0;
            return;
        }

        let Some(marked_ms) = self.time_marked_unknown_ms else {
            self.time_marked_unknown_ms = Some(now_ms);
            return;
        };
        let disconnected_ms = now_ms.saturating_sub(marked_ms);
        let disconnected_min = disconnected_ms / DISCONNECT_LOG_INTERVAL_MS;
        if disconnected_min > self.total_disconnected_min {
            warn!(
                "Consumer has been disconnected from the group coordinator for {}ms",
                disconnected_ms
            );
            self.total_disconnected_min = disconnected_min;
        }
    }

    /// Only a lost connection invalidates the coordinator
    pub fn handle_coordinator_disconnect(&mut self, error: &ConsumerError, now_ms: u64) {
        if error.is_disconnect() {
            self.mark_coordinator_unknown(&error.to_string(), now_ms);
        }
    }

    pub fn coordinator(&self) -> Option<&Node> {
        self.coordinator.as_ref()
    }

    pub fn fatal_error(&self) -> Option<&ConsumerError> {
        self.fatal_error.as_ref()
    }

    /// Returns the pending fatal error once
    pub fn get_and_clear_fatal_error(&mut self) -> Option<ConsumerError> {
        self.fatal_error.take()
    }
}
