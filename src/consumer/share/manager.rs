//! Share fetch and acknowledgement request manager
//!
//! Runs on the background thread. Each poll:
//!
//! 1. routes acknowledgements handed over by the last `fetch` either onto the
//!    next ShareFetch to the same node or into the node's commitAsync state
//! 2. advances the acknowledgement states of every idle node, in the order
//!    commitAsync, commitSync (FIFO), close
//! 3. when step 2 produced nothing, builds at most one ShareFetch per leader
//!    node with fetchable partitions
//!
//! A node has at most one request in flight, fetch or acknowledge.
//! Acknowledgements for a partition whose leader moved away from the node that
//! delivered the records fail with `NOT_LEADER_OR_FOLLOWER`; the records
//! will be redelivered by the new leader.

use super::ack_state::{AckMap, AcknowledgeRequestState, AcknowledgeRequestType};
use super::result_handler::{CommitCallbackSink, ResultHandler};
use super::session::{ShareSessionHandler, FINAL_EPOCH, INITIAL_EPOCH};
use super::ShareCompletedFetch;
use crate::config::ConsumerConfig;
use crate::consumer::events::{AcknowledgementResults, AcknowledgementsMap, BackgroundEvent, BackgroundEventHandler};
use crate::consumer::future::CompletableResult;
use crate::consumer::metadata::MetadataView;
use crate::consumer::protocol::{
    LeaderIdAndEpoch, Node, NodeEndpoint, RequestBody, ResponseBody, ShareAcknowledgeRequest, ShareFetchPartition,
    ShareFetchRequest,
};
use crate::consumer::request::{PollResult, RequestHandler, RequestState, UnsentRequest};
use crate::consumer::subscription::SubscriptionState;
use crate::consumer::topic_partition::{TopicIdPartition, TopicPartition};
use crate::error::{ConsumerError, KafkaErrorCode, Result};
use crate::metrics;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// Acknowledgement states pending for one node
#[derive(Debug, Default)]
struct NodeAckStates {
    async_state: Option<AcknowledgeRequestState>,
    sync_states: VecDeque<AcknowledgeRequestState>,
    close_state: Option<AcknowledgeRequestState>,
}

impl NodeAckStates {
    fn iter(&self) -> impl Iterator<Item = &AcknowledgeRequestState> {
        self.async_state
            .iter()
            .chain(self.sync_states.iter())
            .chain(self.close_state.iter())
    }

    fn request_in_flight(&self) -> bool {
        self.iter().any(AcknowledgeRequestState::request_in_flight)
    }

    fn is_empty(&self) -> bool {
        self.async_state.is_none() && self.sync_states.is_empty() && self.close_state.is_none()
    }

    /// State owning the outstanding request of the given type
    fn in_flight_mut(&mut self, request_type: AcknowledgeRequestType) -> Option<&mut AcknowledgeRequestState> {
        match request_type {
            AcknowledgeRequestType::CommitAsync => self.async_state.as_mut(),
            AcknowledgeRequestType::CommitSync => self.sync_states.iter_mut().find(|s| s.request_in_flight()),
            AcknowledgeRequestType::Close => self.close_state.as_mut(),
        }
    }

    fn remove_finished(&mut self) {
        if self.async_state.as_ref().is_some_and(AcknowledgeRequestState::is_finished) {
            self.async_state = None;
        }
        self.sync_states.retain(|s| !s.is_finished());
        if self.close_state.as_ref().is_some_and(AcknowledgeRequestState::is_finished) {
            self.close_state = None;
        }
    }
}

enum Step {
    Send(UnsentRequest),
    Wait(u64),
    Finished,
}

struct StepContext<'a> {
    group_id: &'a str,
    member_id: &'a str,
    node: Option<Node>,
    session_epoch: Option<i32>,
    sink: &'a CommitCallbackSink<'a>,
    now_ms: u64,
}

pub struct ShareConsumeRequestManager {
    group_id: String,
    retry_backoff_ms: u64,
    retry_backoff_max_ms: u64,
    retry_backoff_jitter: f64,
    default_api_timeout_ms: u64,
    max_wait_ms: u32,
    min_bytes: u32,
    max_bytes: u32,
    max_records: u32,
    background: BackgroundEventHandler,
    sessions: BTreeMap<i32, ShareSessionHandler>,
    node_states: BTreeMap<i32, NodeAckStates>,
    /// Acknowledgements waiting to ride on the next fetch to their node
    fetch_acknowledgements: BTreeMap<i32, AckMap>,
    /// Outstanding fetches and the acknowledgements they carry
    fetch_in_flight: BTreeMap<i32, AckMap>,
    async_handler: ResultHandler,
    fetch_enabled: bool,
    closing: bool,
    commit_callback_enabled: bool,
}

impl ShareConsumeRequestManager {
    pub fn new(config: &ConsumerConfig, background: BackgroundEventHandler) -> Self {
        Self {
            group_id: config.group_id.clone(),
            retry_backoff_ms: config.retry_backoff_ms,
            retry_backoff_max_ms: config.retry_backoff_max_ms,
            retry_backoff_jitter: config.retry_backoff_jitter,
            default_api_timeout_ms: config.default_api_timeout_ms,
            max_wait_ms: config.fetch_max_wait_ms,
            min_bytes: config.fetch_min_bytes,
            max_bytes: config.fetch_max_bytes,
            max_records: config.max_poll_records,
            background,
            sessions: BTreeMap::new(),
            node_states: BTreeMap::new(),
            fetch_acknowledgements: BTreeMap::new(),
            fetch_in_flight: BTreeMap::new(),
            async_handler: ResultHandler::for_async(),
            fetch_enabled: false,
            closing: false,
            commit_callback_enabled: false,
        }
    }

    fn request_state(&self) -> RequestState {
        RequestState::new(
            "share-acknowledge",
            self.retry_backoff_ms,
            self.retry_backoff_max_ms,
            self.retry_backoff_jitter,
        )
    }

    pub fn set_commit_callback_enabled(&mut self, enabled: bool) {
        self.commit_callback_enabled = enabled;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// True while any acknowledgement is queued, retrying or in flight
    pub fn has_pending_acknowledgements(&self) -> bool {
        !self.node_states.is_empty()
            || self.fetch_acknowledgements.values().any(|a| !a.is_empty())
            || self.fetch_in_flight.values().any(|a| !a.is_empty())
    }

    pub fn session(&self, node_id: i32) -> Option<&ShareSessionHandler> {
        self.sessions.get(&node_id)
    }

    // ========== Application Entry Points ==========

    /// Request more records; `acknowledgements` ride on the next fetch to each node
    pub fn fetch(&mut self, acknowledgements: AcknowledgementsMap) {
        if self.closing {
            debug!("Ignoring fetch while closing");
            return;
        }
        for (node_id, acks) in group_by_node(acknowledgements) {
            let pending = self.fetch_acknowledgements.entry(node_id).or_default();
            for (partition, acks) in acks {
                pending.entry(partition).or_default().merge(acks);
            }
        }
        self.fetch_enabled = true;
    }

    /// Queue acknowledgements for the next commitAsync request to each node
    pub fn acknowledge_async(&mut self, acknowledgements: AcknowledgementsMap, now_ms: u64) {
        let deadline_ms = now_ms.saturating_add(self.default_api_timeout_ms);
        for (node_id, acks) in group_by_node(acknowledgements) {
            for (partition, acks) in acks {
                self.add_async(node_id, partition, acks, deadline_ms);
            }
        }
    }

    fn add_async(&mut self, node_id: i32, partition: TopicIdPartition, acks: super::Acknowledgements, deadline_ms: u64) {
        let request_state = self.request_state();
        let handler = self.async_handler.clone();
        let states = self.node_states.entry(node_id).or_default();
        let state = states.async_state.get_or_insert_with(|| {
            AcknowledgeRequestState::new(
                node_id,
                AcknowledgeRequestType::CommitAsync,
                AckMap::new(),
                deadline_ms,
                handler,
                request_state,
            )
        });
        state.add(partition, acks, deadline_ms);
    }

    /// One commitSync state per node; `result` completes when all of them finish
    pub fn acknowledge_sync(
        &mut self,
        acknowledgements: AcknowledgementsMap,
        deadline_ms: u64,
        result: CompletableResult<AcknowledgementResults>,
    ) {
        let by_node = group_by_node(acknowledgements);
        let handler = ResultHandler::for_sync(result, by_node.len());
        if by_node.is_empty() {
            let sink = CommitCallbackSink::new(&self.background, self.commit_callback_enabled);
            handler.complete_if_empty(&sink);
            return;
        }
        for (node_id, acks) in by_node {
            let state = AcknowledgeRequestState::new(
                node_id,
                AcknowledgeRequestType::CommitSync,
                acks,
                deadline_ms,
                handler.clone(),
                self.request_state(),
            );
            self.node_states.entry(node_id).or_default().sync_states.push_back(state);
        }
    }

    /// Final acknowledgements plus a session-closing request to every node with
    /// an open share session. Pending piggy-back acknowledgements are included.
    pub fn acknowledge_on_close(
        &mut self,
        acknowledgements: AcknowledgementsMap,
        deadline_ms: u64,
        result: CompletableResult<()>,
    ) {
        self.closing = true;
        self.fetch_enabled = false;

        let mut by_node = group_by_node(acknowledgements);
        for (node_id, pending) in std::mem::take(&mut self.fetch_acknowledgements) {
            let acks = by_node.entry(node_id).or_default();
            for (partition, pending) in pending {
                acks.entry(partition).or_default().merge(pending);
            }
        }
        by_node.retain(|_, acks| !acks.is_empty());

        let mut nodes: BTreeSet<i32> = by_node.keys().copied().collect();
        nodes.extend(
            self.sessions
                .iter()
                .filter(|(_, session)| session.epoch() != INITIAL_EPOCH)
                .map(|(node_id, _)| *node_id),
        );

        let handler = ResultHandler::for_close(result, nodes.len());
        if nodes.is_empty() {
            let sink = CommitCallbackSink::new(&self.background, self.commit_callback_enabled);
            handler.complete_if_empty(&sink);
            return;
        }
        debug!(nodes = ?nodes, "Closing share sessions");
        for node_id in nodes {
            let state = AcknowledgeRequestState::new(
                node_id,
                AcknowledgeRequestType::Close,
                by_node.remove(&node_id).unwrap_or_default(),
                deadline_ms,
                handler.clone(),
                self.request_state(),
            );
            self.node_states.entry(node_id).or_default().close_state = Some(state);
        }
    }

    // ========== Poll ==========

    pub fn poll(
        &mut self,
        member_id: &str,
        subscriptions: &SubscriptionState,
        metadata: &mut dyn MetadataView,
        now_ms: u64,
    ) -> PollResult {
        let targets = if self.fetch_enabled && !self.closing {
            fetch_targets(subscriptions, metadata)
        } else {
            BTreeMap::new()
        };
        self.route_fetch_acknowledgements(&targets, metadata, now_ms);

        let (mut requests, wait_ms) = self.process_acknowledgements(member_id, metadata, now_ms);
        if !requests.is_empty() {
            return PollResult::with_requests(wait_ms, requests);
        }
        for (node_id, (node, partitions)) in targets {
            if self.node_busy(node_id) {
                trace!(node_id, "Skipping fetch, node has a request in flight");
                continue;
            }
            requests.push(self.build_fetch(member_id, node, partitions));
        }

        if requests.is_empty() {
            PollResult::wait(wait_ms)
        } else {
            PollResult::with_requests(wait_ms, requests)
        }
    }

    fn node_busy(&self, node_id: i32) -> bool {
        self.fetch_in_flight.contains_key(&node_id)
            || self
                .node_states
                .get(&node_id)
                .is_some_and(NodeAckStates::request_in_flight)
    }

    /// Keep acknowledgements that can ride on a fetch this poll; send the rest
    /// on their own
    fn route_fetch_acknowledgements(
        &mut self,
        targets: &BTreeMap<i32, (Node, BTreeSet<TopicIdPartition>)>,
        metadata: &dyn MetadataView,
        now_ms: u64,
    ) {
        if !self.fetch_enabled || self.closing {
            return;
        }
        let sink = CommitCallbackSink::new(&self.background, self.commit_callback_enabled);
        let deadline_ms = now_ms.saturating_add(self.default_api_timeout_ms);
        let mut standalone = Vec::new();

        for (node_id, pending) in std::mem::take(&mut self.fetch_acknowledgements) {
            let mut keep = AckMap::new();
            for (partition, mut acks) in pending {
                if leader_moved(metadata, &partition.topic_partition, node_id) {
                    debug!(partition = %partition, node_id, "Leader changed, failing piggy-backed acknowledgements");
                    acks.complete(Some(not_leader()));
                    self.async_handler.complete(partition, acks, &sink);
                } else if targets
                    .get(&node_id)
                    .is_some_and(|(_, partitions)| partitions.contains(&partition))
                {
                    keep.insert(partition, acks);
                } else {
                    standalone.push((node_id, partition, acks));
                }
            }
            if !keep.is_empty() {
                self.fetch_acknowledgements.insert(node_id, keep);
            }
        }

        for (node_id, partition, acks) in standalone {
            trace!(partition = %partition, node_id, "Partition not fetched, acknowledging on its own");
            self.add_async(node_id, partition, acks, deadline_ms);
        }
    }

    fn build_fetch(&mut self, member_id: &str, node: Node, wanted: BTreeSet<TopicIdPartition>) -> UnsentRequest {
        let node_id = node.id;
        let session = self
            .sessions
            .entry(node_id)
            .or_insert_with(|| ShareSessionHandler::new(node_id));
        let data = session.prepare_fetch(wanted);
        let piggy_backed = self.fetch_acknowledgements.remove(&node_id).unwrap_or_default();

        let mut partitions: BTreeMap<TopicIdPartition, ShareFetchPartition> = data
            .to_send
            .iter()
            .map(|partition| {
                (
                    partition.clone(),
                    ShareFetchPartition {
                        partition: partition.clone(),
                        acknowledgement_batches: Vec::new(),
                    },
                )
            })
            .collect();
        for (partition, acks) in &piggy_backed {
            partitions
                .entry(partition.clone())
                .or_insert_with(|| ShareFetchPartition {
                    partition: partition.clone(),
                    acknowledgement_batches: Vec::new(),
                })
                .acknowledgement_batches = acks.to_batches();
        }

        let ack_count: usize = piggy_backed.values().map(|a| a.len()).sum();
        if ack_count > 0 {
            metrics::record_acknowledgements_sent(ack_count);
        }
        debug!(
            node_id,
            epoch = data.epoch,
            partitions = partitions.len(),
            forgotten = data.forgotten.len(),
            acknowledgements = ack_count,
            "Sending ShareFetch request"
        );
        self.fetch_in_flight.insert(node_id, piggy_backed);

        let request = ShareFetchRequest {
            group_id: self.group_id.clone(),
            member_id: member_id.to_string(),
            share_session_epoch: data.epoch,
            max_wait_ms: self.max_wait_ms,
            min_bytes: self.min_bytes,
            max_bytes: self.max_bytes,
            max_records: self.max_records,
            partitions: partitions.into_values().collect(),
            forgotten: data.forgotten.into_iter().collect(),
        };
        UnsentRequest::new(
            RequestBody::ShareFetch(request),
            Some(node),
            RequestHandler::ShareFetch { node_id },
        )
    }

    /// Advance acknowledgement states on every idle node
    fn process_acknowledgements(
        &mut self,
        member_id: &str,
        metadata: &mut dyn MetadataView,
        now_ms: u64,
    ) -> (Vec<UnsentRequest>, u64) {
        let sink = CommitCallbackSink::new(&self.background, self.commit_callback_enabled);
        let mut requests = Vec::new();
        let mut wait_ms = u64::MAX;

        for (node_id, states) in self.node_states.iter_mut() {
            let until_deadline_ms = expire_overdue(states, now_ms, &sink);
            if self.fetch_in_flight.contains_key(node_id) || states.request_in_flight() {
                wait_ms = wait_ms.min(until_deadline_ms);
                continue;
            }
            let ctx = StepContext {
                group_id: &self.group_id,
                member_id,
                node: metadata.node_by_id(*node_id),
                session_epoch: self.sessions.get(node_id).map(ShareSessionHandler::epoch),
                sink: &sink,
                now_ms,
            };
            let (request, node_wait_ms) = process_node(states, &ctx, metadata);
            wait_ms = wait_ms.min(node_wait_ms);
            if let Some(request) = request {
                requests.push(request);
            }
        }
        self.node_states.retain(|_, states| !states.is_empty());
        (requests, wait_ms)
    }

    // ========== Responses ==========

    pub fn handle_fetch_response(
        &mut self,
        node_id: i32,
        outcome: Result<ResponseBody>,
        metadata: &mut dyn MetadataView,
    ) {
        let sink = CommitCallbackSink::new(&self.background, self.commit_callback_enabled);
        let mut piggy_backed = self.fetch_in_flight.remove(&node_id).unwrap_or_default();

        let response = match outcome {
            Ok(ResponseBody::ShareFetch(response)) => response,
            Ok(other) => {
                warn!(node_id, api = other.api_name(), "Unexpected response to ShareFetch");
                fail_all(&self.async_handler, piggy_backed, unexpected_response("ShareFetch", &other), &sink);
                return;
            }
            Err(error) => {
                debug!(node_id, error = %error, "ShareFetch failed");
                if let Some(session) = self.sessions.get_mut(&node_id) {
                    session.handle_error();
                }
                fail_all(&self.async_handler, piggy_backed, error, &sink);
                return;
            }
        };

        apply_leader_hints(
            metadata,
            response
                .partitions
                .iter()
                .map(|(partition, data)| (partition, data.current_leader)),
            &response.node_endpoints,
        );

        let code = KafkaErrorCode::from_i16(response.error_code);
        if code != KafkaErrorCode::None {
            debug!(node_id, error_code = ?code, "ShareFetch returned a top-level error");
            if let Some(session) = self.sessions.get_mut(&node_id) {
                session.handle_error();
            }
            if code.is_leadership_error() {
                metadata.request_update();
            }
            let error = ConsumerError::from_code(code, response.error_message.as_deref());
            fail_all(&self.async_handler, piggy_backed, error, &sink);
            return;
        }

        if let Some(session) = self.sessions.get_mut(&node_id) {
            session.handle_response();
        }

        let mut acquired = false;
        for (partition, data) in response.partitions {
            if let Some(mut acks) = piggy_backed.remove(&partition) {
                let ack_code = KafkaErrorCode::from_i16(data.acknowledge_error_code);
                let error = (ack_code != KafkaErrorCode::None)
                    .then(|| ConsumerError::from_code(ack_code, data.acknowledge_error_message.as_deref()));
                acks.complete(error);
                self.async_handler.complete(partition.clone(), acks, &sink);
            }

            let partition_code = KafkaErrorCode::from_i16(data.error_code);
            if partition_code.is_leadership_error() || partition_code == KafkaErrorCode::UnknownTopicId {
                debug!(partition = %partition, error_code = ?partition_code, "Requesting metadata update after fetch error");
                metadata.request_update();
            }
            acquired |= !data.acquired_records.is_empty();
            self.background.add(BackgroundEvent::ShareFetchCompleted(ShareCompletedFetch {
                node_id,
                partition,
                data,
            }));
        }

        let missing = ConsumerError::InvalidRecordState("partition missing from ShareFetch response".to_string());
        fail_all(&self.async_handler, piggy_backed, missing, &sink);

        if acquired {
            // wait for the application to ask again
            self.fetch_enabled = false;
        }
    }

    pub fn handle_acknowledge_response(
        &mut self,
        node_id: i32,
        request_type: AcknowledgeRequestType,
        outcome: Result<ResponseBody>,
        metadata: &mut dyn MetadataView,
        now_ms: u64,
    ) {
        let sink = CommitCallbackSink::new(&self.background, self.commit_callback_enabled);
        let Some(states) = self.node_states.get_mut(&node_id) else {
            debug!(node_id, request_type = %request_type, "No acknowledgement state for response");
            return;
        };
        let Some(state) = states.in_flight_mut(request_type) else {
            debug!(node_id, request_type = %request_type, "No request in flight for response");
            return;
        };

        match outcome {
            Err(error) => {
                debug!(node_id, request_type = %request_type, error = %error, "ShareAcknowledge failed, will retry");
                if error.is_disconnect() {
                    if let Some(session) = self.sessions.get_mut(&node_id) {
                        session.handle_error();
                    }
                }
                state.on_failure(now_ms);
            }
            Ok(ResponseBody::ShareAcknowledge(response)) => {
                apply_leader_hints(
                    metadata,
                    response
                        .partitions
                        .iter()
                        .map(|(partition, data)| (partition, data.current_leader)),
                    &response.node_endpoints,
                );

                let code = KafkaErrorCode::from_i16(response.error_code);
                if code != KafkaErrorCode::None {
                    debug!(node_id, request_type = %request_type, error_code = ?code, "ShareAcknowledge returned a top-level error");
                    if matches!(
                        code,
                        KafkaErrorCode::ShareSessionNotFound | KafkaErrorCode::InvalidShareSessionEpoch
                    ) {
                        if let Some(session) = self.sessions.get_mut(&node_id) {
                            session.handle_error();
                        }
                    }
                    state.on_failure(now_ms);
                } else {
                    if request_type == AcknowledgeRequestType::Close {
                        self.sessions.remove(&node_id);
                    } else if let Some(session) = self.sessions.get_mut(&node_id) {
                        session.handle_response();
                    }
                    state.on_success(now_ms);

                    for partition in state.in_flight_partitions() {
                        let Some(acks) = state.take_in_flight(&partition) else {
                            continue;
                        };
                        let Some(data) = response.partitions.get(&partition) else {
                            let error = ConsumerError::InvalidRecordState(
                                "partition missing from ShareAcknowledge response".to_string(),
                            );
                            state.complete(partition, acks, Some(error), &sink);
                            continue;
                        };
                        let partition_code = KafkaErrorCode::from_i16(data.error_code);
                        if partition_code == KafkaErrorCode::None {
                            state.complete(partition, acks, None, &sink);
                        } else if partition_code.is_leadership_error() {
                            metadata.request_update();
                            let error = ConsumerError::from_code(partition_code, data.error_message.as_deref());
                            state.complete(partition, acks, Some(error), &sink);
                        } else if partition_code.is_retriable() {
                            trace!(partition = %partition, error_code = ?partition_code, "Retrying acknowledgements");
                            state.retry(partition, acks);
                        } else {
                            let error = ConsumerError::from_code(partition_code, data.error_message.as_deref());
                            state.complete(partition, acks, Some(error), &sink);
                        }
                    }
                }
            }
            Ok(other) => {
                warn!(node_id, api = other.api_name(), "Unexpected response to ShareAcknowledge");
                state.fail_in_flight(unexpected_response("ShareAcknowledge", &other), now_ms, &sink);
            }
        }

        state.maybe_finish(&sink);
        states.remove_finished();
        if states.is_empty() {
            self.node_states.remove(&node_id);
        }
    }
}

// ========== Helpers ==========

fn group_by_node(acknowledgements: AcknowledgementsMap) -> BTreeMap<i32, AckMap> {
    let mut by_node: BTreeMap<i32, AckMap> = BTreeMap::new();
    for (partition, node_acks) in acknowledgements {
        if node_acks.acknowledgements.is_empty() {
            continue;
        }
        by_node
            .entry(node_acks.node_id)
            .or_default()
            .entry(partition)
            .or_default()
            .merge(node_acks.acknowledgements);
    }
    by_node
}

/// Fetchable partitions grouped by leader; unknown leaders trigger a metadata update
fn fetch_targets(
    subscriptions: &SubscriptionState,
    metadata: &mut dyn MetadataView,
) -> BTreeMap<i32, (Node, BTreeSet<TopicIdPartition>)> {
    let mut targets: BTreeMap<i32, (Node, BTreeSet<TopicIdPartition>)> = BTreeMap::new();
    for partition in subscriptions.fetchable_partitions() {
        let leader = metadata.current_leader(&partition).leader;
        let topic_id = metadata.topic_id(&partition.topic);
        let (Some(leader), Some(topic_id)) = (leader, topic_id) else {
            trace!(partition = %partition, "Leader or topic id unknown, skipping fetch");
            metadata.request_update();
            continue;
        };
        targets
            .entry(leader.id)
            .or_insert_with(|| (leader.clone(), BTreeSet::new()))
            .1
            .insert(TopicIdPartition {
                topic_id,
                topic_partition: partition,
            });
    }
    targets
}

fn leader_moved(metadata: &dyn MetadataView, partition: &TopicPartition, node_id: i32) -> bool {
    metadata
        .current_leader(partition)
        .leader
        .is_some_and(|leader| leader.id != node_id)
}

fn not_leader() -> ConsumerError {
    ConsumerError::from_code(KafkaErrorCode::NotLeaderOrFollower, None)
}

fn unexpected_response(expected: &str, got: &ResponseBody) -> ConsumerError {
    ConsumerError::illegal_state(expected, format!("unexpected {} response", got.api_name()))
}

fn fail_all(handler: &ResultHandler, acknowledgements: AckMap, error: ConsumerError, sink: &CommitCallbackSink<'_>) {
    for (partition, mut acks) in acknowledgements {
        acks.complete(Some(error.clone()));
        handler.complete(partition, acks, sink);
    }
}

fn apply_leader_hints<'a>(
    metadata: &mut dyn MetadataView,
    hints: impl Iterator<Item = (&'a TopicIdPartition, LeaderIdAndEpoch)>,
    endpoints: &[NodeEndpoint],
) {
    let leaders: BTreeMap<TopicPartition, LeaderIdAndEpoch> = hints
        .filter(|(_, leader)| leader.is_known())
        .map(|(partition, leader)| (partition.topic_partition.clone(), leader))
        .collect();
    if leaders.is_empty() {
        return;
    }
    let nodes: Vec<Node> = endpoints.iter().map(Node::from).collect();
    let updated = metadata.update_partition_leadership(&leaders, &nodes);
    if !updated.is_empty() {
        debug!(partitions = updated.len(), "Applied leader hints from response");
    }
}

/// Fail sync and close states past their deadline, even while the node is
/// busy with another request. Returns the time until the next such deadline.
fn expire_overdue(states: &mut NodeAckStates, now_ms: u64, sink: &CommitCallbackSink<'_>) -> u64 {
    let mut until_deadline_ms = u64::MAX;
    states.sync_states.retain_mut(|state| {
        if state.request_in_flight() {
            return true;
        }
        if !state.is_expired(now_ms) {
            until_deadline_ms = until_deadline_ms.min(state.deadline_ms() - now_ms);
            return true;
        }
        state.expire(sink);
        !state.maybe_finish(sink)
    });
    if let Some(state) = states.close_state.as_mut() {
        if !state.request_in_flight() {
            if state.is_expired(now_ms) {
                state.expire(sink);
                if state.maybe_finish(sink) {
                    states.close_state = None;
                }
            } else {
                until_deadline_ms = until_deadline_ms.min(state.deadline_ms() - now_ms);
            }
        }
    }
    until_deadline_ms
}

/// Advance a node's states; at most one request is produced
fn process_node(
    states: &mut NodeAckStates,
    ctx: &StepContext<'_>,
    metadata: &mut dyn MetadataView,
) -> (Option<UnsentRequest>, u64) {
    let mut wait_ms = u64::MAX;

    if let Some(state) = states.async_state.as_mut() {
        match step(state, ctx, metadata) {
            Step::Send(request) => return (Some(request), wait_ms),
            // sync commits wait until earlier async ones are flushed
            Step::Wait(ms) => return (None, ms),
            Step::Finished => states.async_state = None,
        }
    }

    while let Some(state) = states.sync_states.front_mut() {
        match step(state, ctx, metadata) {
            Step::Send(request) => return (Some(request), wait_ms),
            Step::Wait(ms) => {
                wait_ms = wait_ms.min(ms);
                break;
            }
            Step::Finished => {
                states.sync_states.pop_front();
            }
        }
    }

    // the session closes only after earlier commits are done
    if states.async_state.is_none() && states.sync_states.is_empty() {
        if let Some(state) = states.close_state.as_mut() {
            match step(state, ctx, metadata) {
                Step::Send(request) => return (Some(request), wait_ms),
                Step::Wait(ms) => wait_ms = wait_ms.min(ms),
                Step::Finished => states.close_state = None,
            }
        }
    }
    (None, wait_ms)
}

fn step(state: &mut AcknowledgeRequestState, ctx: &StepContext<'_>, metadata: &mut dyn MetadataView) -> Step {
    let now_ms = ctx.now_ms;
    if state.request_in_flight() {
        return Step::Wait(u64::MAX);
    }

    for partition in state.unsent_partitions() {
        if leader_moved(metadata, &partition.topic_partition, state.node_id()) {
            debug!(
                partition = %partition,
                node_id = state.node_id(),
                "Leader changed, failing unsent acknowledgements"
            );
            state.fail_unsent(&partition, not_leader(), ctx.sink);
        }
    }
    if state.is_expired(now_ms) {
        state.expire(ctx.sink);
    }
    if !state.has_unsent() && !state.needs_empty_close() {
        return if state.maybe_finish(ctx.sink) {
            Step::Finished
        } else {
            Step::Wait(u64::MAX)
        };
    }

    let until_deadline_ms = state.deadline_ms().saturating_sub(now_ms);
    if !state.can_send(now_ms) {
        return Step::Wait(state.remaining_backoff_ms(now_ms).min(until_deadline_ms));
    }

    let epoch = match (state.request_type(), ctx.session_epoch) {
        (AcknowledgeRequestType::Close, _) => FINAL_EPOCH,
        (_, Some(epoch)) if epoch != INITIAL_EPOCH => epoch,
        _ => {
            debug!(node_id = state.node_id(), "No open share session, failing acknowledgements");
            state.fail_all_unsent(
                ConsumerError::from_code(KafkaErrorCode::ShareSessionNotFound, None),
                ctx.sink,
            );
            return if state.maybe_finish(ctx.sink) {
                Step::Finished
            } else {
                Step::Wait(u64::MAX)
            };
        }
    };

    let Some(node) = ctx.node.clone() else {
        debug!(node_id = state.node_id(), "Node unknown, waiting for metadata");
        metadata.request_update();
        return Step::Wait(until_deadline_ms);
    };

    let acknowledgements = state.prepare_send(now_ms);
    metrics::record_acknowledgements_sent(state.in_flight_count());
    debug!(
        node_id = node.id,
        request_type = %state.request_type(),
        epoch,
        partitions = acknowledgements.len(),
        "Sending ShareAcknowledge request"
    );
    let request = ShareAcknowledgeRequest {
        group_id: ctx.group_id.to_string(),
        member_id: ctx.member_id.to_string(),
        share_session_epoch: epoch,
        acknowledgements,
    };
    Step::Send(UnsentRequest::new(
        RequestBody::ShareAcknowledge(request),
        Some(node),
        RequestHandler::ShareAcknowledge {
            node_id: state.node_id(),
            request_type: state.request_type(),
        },
    ))
}
