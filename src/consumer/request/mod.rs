//! Request managers and the network delegate they feed
//!
//! Every manager exposes `poll(now)` returning a [`PollResult`]: the requests
//! it wants sent plus how long the background loop may sleep before polling
//! it again. Completions come back as [`CompletedRequest`]s tagged with the
//! [`RequestHandler`] that identifies the owning manager.

pub mod coordinator;
pub mod network;
pub mod state;

use super::protocol::{Node, RequestBody, ResponseBody};
use super::share::AcknowledgeRequestType;
use crate::error::Result;
use crate::util::Timer;

pub use coordinator::CoordinatorRequestManager;
pub use network::{ClientResponse, KafkaClient, NetworkClientDelegate, NetworkWaker};
pub use state::RequestState;

/// Identifies which manager, and which logical request, a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestHandler {
    FindCoordinator,
    /// Group heartbeat; leave heartbeats sent on poll timer expiry ignore the response
    Heartbeat { ignore_response: bool },
    ShareFetch { node_id: i32 },
    ShareAcknowledge {
        node_id: i32,
        request_type: AcknowledgeRequestType,
    },
}

/// A request produced by a manager and not yet handed to the transport
#[derive(Debug, Clone)]
pub struct UnsentRequest {
    pub body: RequestBody,
    /// Target node; `None` sends to the least loaded node
    pub node: Option<Node>,
    pub handler: RequestHandler,
    /// Set by the delegate when the request is queued
    pub timer: Option<Timer>,
}

impl UnsentRequest {
    pub fn new(body: RequestBody, node: Option<Node>, handler: RequestHandler) -> Self {
        Self {
            body,
            node,
            handler,
            timer: None,
        }
    }
}

/// Output of one manager poll
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub time_until_next_poll_ms: u64,
    pub unsent_requests: Vec<UnsentRequest>,
}

impl PollResult {
    /// No requests and no wake-up preference
    pub fn empty() -> Self {
        Self::wait(u64::MAX)
    }

    pub fn wait(time_until_next_poll_ms: u64) -> Self {
        Self {
            time_until_next_poll_ms,
            unsent_requests: Vec::new(),
        }
    }

    pub fn with_request(time_until_next_poll_ms: u64, request: UnsentRequest) -> Self {
        Self {
            time_until_next_poll_ms,
            unsent_requests: vec![request],
        }
    }

    pub fn with_requests(time_until_next_poll_ms: u64, requests: Vec<UnsentRequest>) -> Self {
        Self {
            time_until_next_poll_ms,
            unsent_requests: requests,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unsent_requests.is_empty()
    }
}

/// A request that finished, successfully or not
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub handler: RequestHandler,
    /// Node the request was sent to, if one was chosen
    pub node: Option<Node>,
    pub outcome: Result<ResponseBody>,
    pub received_ms: u64,
}
