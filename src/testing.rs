//! Test doubles for the group coordination engine
//!
//! # Stability
//!
//! **⚠️ Experimental** - This module is under active development.
//!
//! # Features
//!
//! - **MockClient**: in-memory [`KafkaClient`] with scripted responses
//! - **SharedMetadata**: metadata cache that tests can mutate while the
//!   background thread is running
//! - **MockClock**: manually advanced clock (re-exported from `util`)
//!
//! # Example
//!
//! ```ignore
//! use streamline_client::testing::MockClient;
//! use streamline_client::consumer::protocol::{Node, RequestBody, ResponseBody, FindCoordinatorResponse};
//!
//! let client = MockClient::new(vec![Node::new(1, "localhost", 9092)]);
//! client.respond_with(|node, body| match body {
//!     RequestBody::FindCoordinator(req) => Some(ResponseBody::FindCoordinator(
//!         FindCoordinatorResponse::found(req.key.clone(), node.clone()),
//!     )),
//!     _ => None,
//! });
//! ```

use crate::consumer::metadata::{ClusterMetadata, LeaderAndEpoch, MetadataView};
use crate::consumer::protocol::{LeaderIdAndEpoch, Node, RequestBody, ResponseBody};
use crate::consumer::request::{ClientResponse, KafkaClient, NetworkWaker};
use crate::consumer::topic_partition::TopicPartition;
use crate::error::ConsumerError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use crate::util::MockClock;

/// Longest a mock transport poll blocks, whatever timeout it was given
const MAX_BLOCK_MS: u64 = 50;

// ============================================================================
// Mock Transport
// ============================================================================

type Responder = Box<dyn FnMut(&Node, &RequestBody) -> Option<ResponseBody> + Send>;

/// A request handed to the mock transport
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub correlation_id: i32,
    pub node: Node,
    pub body: RequestBody,
    pub sent_ms: u64,
}

struct MockState {
    nodes: Vec<Node>,
    not_ready: BTreeSet<i32>,
    failed: BTreeSet<i32>,
    auth_errors: BTreeMap<i32, ConsumerError>,
    responder: Option<Responder>,
    disconnect_responses: bool,
    sent: Vec<SentRequest>,
    /// Sent requests nobody has answered yet
    unanswered: BTreeMap<i32, Node>,
    ready_responses: VecDeque<ClientResponse>,
    woken: bool,
    close_count: usize,
}

struct Shared {
    state: Mutex<MockState>,
    signal: Condvar,
}

impl Shared {
    fn notify(&self, mut state: MutexGuard<'_, MockState>) {
        state.woken = true;
        drop(state);
        self.signal.notify_all();
    }
}

struct MockWaker {
    shared: Arc<Shared>,
}

impl NetworkWaker for MockWaker {
    fn wakeup(&self) {
        self.shared.notify(self.shared.state.lock());
    }
}

/// In-memory transport. Clones share state, so a test keeps one handle and
/// gives another to the code under test.
///
/// Every sent request is offered to the responder installed with
/// [`respond_with`](Self::respond_with); requests it declines stay in flight
/// until the test answers them with [`respond`](Self::respond) or
/// [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct MockClient {
    shared: Arc<Shared>,
}

impl MockClient {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    nodes,
                    not_ready: BTreeSet::new(),
                    failed: BTreeSet::new(),
                    auth_errors: BTreeMap::new(),
                    responder: None,
                    disconnect_responses: false,
                    sent: Vec::new(),
                    unanswered: BTreeMap::new(),
                    ready_responses: VecDeque::new(),
                    woken: false,
                    close_count: 0,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// Answer requests as they are sent; `None` leaves the request in flight
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&Node, &RequestBody) -> Option<ResponseBody> + Send + 'static,
    {
        self.shared.state.lock().responder = Some(Box::new(responder));
    }

    /// Answer an in-flight request
    pub fn respond(&self, correlation_id: i32, body: ResponseBody) -> bool {
        let mut state = self.shared.state.lock();
        let Some(node) = state.unanswered.remove(&correlation_id) else {
            return false;
        };
        state
            .ready_responses
            .push_back(ClientResponse::received(correlation_id, node.id, body));
        self.shared.notify(state);
        true
    }

    /// Drop the connection under an in-flight request
    pub fn disconnect(&self, correlation_id: i32) -> bool {
        let mut state = self.shared.state.lock();
        let Some(node) = state.unanswered.remove(&correlation_id) else {
            return false;
        };
        state
            .ready_responses
            .push_back(ClientResponse::disconnected(correlation_id, node.id));
        self.shared.notify(state);
        true
    }

    /// Every sent request gets a disconnected response
    pub fn disconnect_responses(&self, enabled: bool) {
        self.shared.state.lock().disconnect_responses = enabled;
    }

    pub fn set_node_ready(&self, node_id: i32, ready: bool) {
        let mut state = self.shared.state.lock();
        if ready {
            state.not_ready.remove(&node_id);
        } else {
            state.not_ready.insert(node_id);
        }
    }

    /// Mark the connection to `node_id` as failed
    pub fn fail_connection(&self, node_id: i32) {
        self.shared.state.lock().failed.insert(node_id);
    }

    /// Mark the connection as failed by an authentication error
    pub fn fail_authentication(&self, node_id: i32, error: ConsumerError) {
        let mut state = self.shared.state.lock();
        state.failed.insert(node_id);
        state.auth_errors.insert(node_id, error);
    }

    pub fn sent_requests(&self) -> Vec<SentRequest> {
        self.shared.state.lock().sent.clone()
    }

    /// Sent requests of one API, in send order
    pub fn sent_of(&self, api: &str) -> Vec<SentRequest> {
        self.shared
            .state
            .lock()
            .sent
            .iter()
            .filter(|r| r.body.api_name() == api)
            .cloned()
            .collect()
    }

    /// Correlation ids of requests still waiting for an answer
    pub fn unanswered(&self) -> Vec<i32> {
        self.shared.state.lock().unanswered.keys().copied().collect()
    }

    pub fn close_count(&self) -> usize {
        self.shared.state.lock().close_count
    }
}

impl KafkaClient for MockClient {
    fn ready(&mut self, node: &Node, _now_ms: u64) -> bool {
        let state = self.shared.state.lock();
        !state.not_ready.contains(&node.id) && !state.failed.contains(&node.id)
    }

    fn connection_failed(&self, node: &Node) -> bool {
        self.shared.state.lock().failed.contains(&node.id)
    }

    fn authentication_error(&self, node: &Node) -> Option<ConsumerError> {
        self.shared.state.lock().auth_errors.get(&node.id).cloned()
    }

    fn least_loaded_node(&self, _now_ms: u64) -> Option<Node> {
        let state = self.shared.state.lock();
        state
            .nodes
            .iter()
            .find(|n| !state.failed.contains(&n.id) && !state.not_ready.contains(&n.id))
            .cloned()
    }

    fn send(&mut self, correlation_id: i32, node: &Node, body: RequestBody, now_ms: u64) {
        let mut state = self.shared.state.lock();
        state.sent.push(SentRequest {
            correlation_id,
            node: node.clone(),
            body: body.clone(),
            sent_ms: now_ms,
        });
        if state.disconnect_responses {
            state
                .ready_responses
                .push_back(ClientResponse::disconnected(correlation_id, node.id));
            return;
        }
        let answer = state.responder.as_mut().and_then(|respond| respond(node, &body));
        match answer {
            Some(response) => state
                .ready_responses
                .push_back(ClientResponse::received(correlation_id, node.id, response)),
            None => {
                state.unanswered.insert(correlation_id, node.clone());
            }
        }
    }

    fn poll(&mut self, timeout_ms: u64, _now_ms: u64) -> Vec<ClientResponse> {
        let mut state = self.shared.state.lock();
        if state.ready_responses.is_empty() && !state.woken && timeout_ms > 0 {
            let wait = Duration::from_millis(timeout_ms.min(MAX_BLOCK_MS));
            let _ = self.shared.signal.wait_for(&mut state, wait);
        }
        state.woken = false;
        state.ready_responses.drain(..).collect()
    }

    fn waker(&self) -> Arc<dyn NetworkWaker> {
        Arc::new(MockWaker {
            shared: Arc::clone(&self.shared),
        })
    }

    fn in_flight_request_count(&self) -> usize {
        self.shared.state.lock().unanswered.len()
    }

    fn close(&mut self) {
        self.shared.state.lock().close_count += 1;
    }
}

// ============================================================================
// Shared Metadata
// ============================================================================

/// [`ClusterMetadata`] behind a mutex, so tests can move leaders while the
/// background thread reads it
#[derive(Clone, Default)]
pub struct SharedMetadata {
    inner: Arc<Mutex<ClusterMetadata>>,
}

impl SharedMetadata {
    pub fn new(metadata: ClusterMetadata) -> Self {
        Self {
            inner: Arc::new(Mutex::new(metadata)),
        }
    }

    /// Run `f` with exclusive access to the cache
    pub fn update<R>(&self, f: impl FnOnce(&mut ClusterMetadata) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl MetadataView for SharedMetadata {
    fn node_by_id(&self, node_id: i32) -> Option<Node> {
        self.inner.lock().node_by_id(node_id)
    }

    fn current_leader(&self, partition: &TopicPartition) -> LeaderAndEpoch {
        self.inner.lock().current_leader(partition)
    }

    fn topic_id(&self, topic: &str) -> Option<Uuid> {
        self.inner.lock().topic_id(topic)
    }

    fn topic_name(&self, topic_id: &Uuid) -> Option<String> {
        self.inner.lock().topic_name(topic_id)
    }

    fn partitions_for_topic(&self, topic: &str) -> Vec<i32> {
        self.inner.lock().partitions_for_topic(topic)
    }

    fn request_update(&mut self) {
        self.inner.lock().request_update();
    }

    fn update_requested(&self) -> bool {
        self.inner.lock().update_requested()
    }

    fn update_partition_leadership(
        &mut self,
        leaders: &BTreeMap<TopicPartition, LeaderIdAndEpoch>,
        nodes: &[Node],
    ) -> BTreeSet<TopicPartition> {
        self.inner.lock().update_partition_leadership(leaders, nodes)
    }
}
