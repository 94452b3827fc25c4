//! Acknowledgement request state for one node
//!
//! Acknowledgements move through three maps: `to_send` (queued),
//! `in_flight` (in the outstanding request) and `incomplete` (sent, failed
//! with a retriable error, waiting for the next attempt). A state is finished
//! once all three are empty; its deadline bounds how long retries continue.

use super::acknowledgements::Acknowledgements;
use super::result_handler::{CommitCallbackSink, ResultHandler};
use crate::consumer::protocol::AcknowledgementBatch;
use crate::consumer::request::RequestState;
use crate::consumer::topic_partition::TopicIdPartition;
use crate::error::{ConsumerError, KafkaErrorCode};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

pub type AckMap = BTreeMap<TopicIdPartition, Acknowledgements>;

/// Which commit API produced a request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcknowledgeRequestType {
    CommitAsync,
    CommitSync,
    Close,
}

impl fmt::Display for AcknowledgeRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcknowledgeRequestType::CommitAsync => "commitAsync",
            AcknowledgeRequestType::CommitSync => "commitSync",
            AcknowledgeRequestType::Close => "close",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct AcknowledgeRequestState {
    node_id: i32,
    request_type: AcknowledgeRequestType,
    request_state: RequestState,
    deadline_ms: u64,
    to_send: AckMap,
    in_flight: AckMap,
    incomplete: AckMap,
    result_handler: ResultHandler,
    /// A close request is sent even with nothing to acknowledge
    empty_close_pending: bool,
    finished: bool,
}

impl AcknowledgeRequestState {
    pub fn new(
        node_id: i32,
        request_type: AcknowledgeRequestType,
        acknowledgements: AckMap,
        deadline_ms: u64,
        result_handler: ResultHandler,
        request_state: RequestState,
    ) -> Self {
        Self {
            node_id,
            request_type,
            request_state,
            deadline_ms,
            to_send: acknowledgements,
            in_flight: AckMap::new(),
            incomplete: AckMap::new(),
            result_handler,
            empty_close_pending: request_type == AcknowledgeRequestType::Close,
            finished: false,
        }
    }

    pub fn node_id(&self) -> i32 {
        self.node_id
    }

    pub fn request_type(&self) -> AcknowledgeRequestType {
        self.request_type
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// Queue more acknowledgements, pushing the deadline out to `deadline_ms`
    pub fn add(&mut self, partition: TopicIdPartition, acknowledgements: Acknowledgements, deadline_ms: u64) {
        self.to_send
            .entry(partition)
            .or_default()
            .merge(acknowledgements);
        self.deadline_ms = self.deadline_ms.max(deadline_ms);
    }

    pub fn request_in_flight(&self) -> bool {
        self.request_state.request_in_flight()
    }

    /// Queued or retrying acknowledgements not yet in a request
    pub fn has_unsent(&self) -> bool {
        !self.to_send.is_empty() || !self.incomplete.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }

    pub fn can_send(&self, now_ms: u64) -> bool {
        self.request_state.can_send_request(now_ms)
    }

    pub fn remaining_backoff_ms(&self, now_ms: u64) -> u64 {
        self.request_state.remaining_backoff_ms(now_ms)
    }

    /// Partitions waiting to be sent
    pub fn unsent_partitions(&self) -> Vec<TopicIdPartition> {
        self.to_send
            .keys()
            .chain(self.incomplete.keys())
            .cloned()
            .collect()
    }

    /// Fail unsent acknowledgements for `partition`
    pub fn fail_unsent(&mut self, partition: &TopicIdPartition, error: ConsumerError, sink: &CommitCallbackSink<'_>) {
        let mut acks = self.to_send.remove(partition).unwrap_or_default();
        if let Some(retry) = self.incomplete.remove(partition) {
            acks.merge(retry);
        }
        if !acks.is_empty() {
            acks.complete(Some(error));
            self.result_handler.complete(partition.clone(), acks, sink);
        }
    }

    /// Deadline passed: everything not in flight fails with a timeout
    pub fn expire(&mut self, sink: &CommitCallbackSink<'_>) {
        if self.has_unsent() {
            debug!(
                node_id = self.node_id,
                request_type = %self.request_type,
                partitions = self.unsent_partitions().len(),
                "Acknowledgements timed out before they could be sent"
            );
        }
        self.fail_all_unsent(ConsumerError::from_code(KafkaErrorCode::RequestTimedOut, None), sink);
    }

    /// Fail everything not in flight and drop any owed close request
    pub fn fail_all_unsent(&mut self, error: ConsumerError, sink: &CommitCallbackSink<'_>) {
        for partition in self.unsent_partitions() {
            self.fail_unsent(&partition, error.clone(), sink);
        }
        self.empty_close_pending = false;
    }

    /// Move queued and retrying acknowledgements into a new request
    pub fn prepare_send(&mut self, now_ms: u64) -> BTreeMap<TopicIdPartition, Vec<AcknowledgementBatch>> {
        let mut pending = std::mem::take(&mut self.incomplete);
        for (partition, acks) in std::mem::take(&mut self.to_send) {
            pending.entry(partition).or_default().merge(acks);
        }
        let batches = pending
            .iter()
            .map(|(partition, acks)| (partition.clone(), acks.to_batches()))
            .collect();
        self.in_flight = pending;
        self.empty_close_pending = false;
        self.request_state.on_send_attempt(now_ms);
        batches
    }

    /// An empty close request is still owed to the node
    pub fn needs_empty_close(&self) -> bool {
        self.empty_close_pending
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.values().map(Acknowledgements::len).sum()
    }

    pub fn on_success(&mut self, now_ms: u64) {
        self.request_state.on_successful_attempt(now_ms);
    }

    /// Request failed as a whole; in-flight acknowledgements are retried
    pub fn on_failure(&mut self, now_ms: u64) {
        self.request_state.on_failed_attempt(now_ms);
        for (partition, acks) in std::mem::take(&mut self.in_flight) {
            self.incomplete.entry(partition).or_default().merge(acks);
        }
    }

    /// Request failed as a whole and must not be retried
    pub fn fail_in_flight(&mut self, error: ConsumerError, now_ms: u64, sink: &CommitCallbackSink<'_>) {
        self.request_state.on_failed_attempt(now_ms);
        for (partition, mut acks) in std::mem::take(&mut self.in_flight) {
            acks.complete(Some(error.clone()));
            self.result_handler.complete(partition, acks, sink);
        }
    }

    pub fn take_in_flight(&mut self, partition: &TopicIdPartition) -> Option<Acknowledgements> {
        self.in_flight.remove(partition)
    }

    pub fn in_flight_partitions(&self) -> Vec<TopicIdPartition> {
        self.in_flight.keys().cloned().collect()
    }

    /// Deliver a partition's outcome to the result handler
    pub fn complete(
        &mut self,
        partition: TopicIdPartition,
        mut acknowledgements: Acknowledgements,
        error: Option<ConsumerError>,
        sink: &CommitCallbackSink<'_>,
    ) {
        acknowledgements.complete(error);
        self.result_handler.complete(partition, acknowledgements, sink);
    }

    /// Put a partition back for another attempt
    pub fn retry(&mut self, partition: TopicIdPartition, acknowledgements: Acknowledgements) {
        self.incomplete
            .entry(partition)
            .or_default()
            .merge(acknowledgements);
    }

    /// Mark finished once nothing is queued, retrying or in flight
    pub fn maybe_finish(&mut self, sink: &CommitCallbackSink<'_>) -> bool {
        if self.finished {
            return true;
        }
        if self.has_unsent() || !self.in_flight.is_empty() || self.request_in_flight() || self.empty_close_pending {
            return false;
        }
        self.finished = true;
        self.result_handler.state_done(sink);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::events::{event_queue, BackgroundEventHandler};
    use crate::consumer::future::CompletableResult;
    use crate::consumer::share::AcknowledgeType;
    use uuid::Uuid;

    fn acks(offsets: &[i64]) -> Acknowledgements {
        let mut acks = Acknowledgements::empty();
        for offset in offsets {
            acks.add(*offset, AcknowledgeType::Accept);
        }
        acks
    }

    fn state(handler: ResultHandler, request_type: AcknowledgeRequestType, partitions: AckMap) -> AcknowledgeRequestState {
        AcknowledgeRequestState::new(
            1,
            request_type,
            partitions,
            1_000,
            handler,
            RequestState::new("acknowledge", 100, 1_000, 0.0),
        )
    }

    #[test]
    fn test_retry_then_complete() {
        let (tx, _rx) = event_queue("background");
        let background = BackgroundEventHandler::new(tx);
        let sink = CommitCallbackSink::new(&background, false);
        let future = CompletableResult::new();
        let tip = TopicIdPartition::new(Uuid::new_v4(), "t", 0);
        let mut state = state(
            ResultHandler::for_sync(future.clone(), 1),
            AcknowledgeRequestType::CommitSync,
            AckMap::from([(tip.clone(), acks(&[1, 2]))]),
        );

        let batches = state.prepare_send(0);
        assert_eq!(batches[&tip][0].last_offset, 2);
        assert!(state.request_in_flight());

        state.on_failure(10);
        assert!(state.has_unsent());
        assert!(!state.can_send(50));
        assert!(state.can_send(110));

        state.prepare_send(110);
        state.on_success(120);
        let sent = state.take_in_flight(&tip).unwrap();
        state.complete(tip.clone(), sent, None, &sink);
        assert!(state.maybe_finish(&sink));

        let results = future.try_get().unwrap().unwrap();
        assert!(results[&tip].error().is_none());
    }

    #[test]
    fn test_expiry_fails_only_unsent() {
        let (tx, _rx) = event_queue("background");
        let background = BackgroundEventHandler::new(tx);
        let sink = CommitCallbackSink::new(&background, false);
        let future = CompletableResult::new();
        let a = TopicIdPartition::new(Uuid::new_v4(), "a", 0);
        let b = TopicIdPartition::new(Uuid::new_v4(), "b", 0);
        let mut state = state(
            ResultHandler::for_sync(future.clone(), 1),
            AcknowledgeRequestType::CommitSync,
            AckMap::from([(a.clone(), acks(&[1]))]),
        );
        state.prepare_send(0);
        state.add(b.clone(), acks(&[4]), 0);

        assert!(state.is_expired(1_000));
        state.expire(&sink);
        assert!(!state.has_unsent());
        assert!(!state.maybe_finish(&sink));

        state.on_success(1_001);
        let sent = state.take_in_flight(&a).unwrap();
        state.complete(a.clone(), sent, None, &sink);
        assert!(state.maybe_finish(&sink));

        let results = future.try_get().unwrap().unwrap();
        assert!(results[&a].error().is_none());
        assert!(matches!(results[&b].error(), Some(ConsumerError::Timeout(_))));
    }

    #[test]
    fn test_close_owes_an_empty_request() {
        let (tx, _rx) = event_queue("background");
        let background = BackgroundEventHandler::new(tx);
        let sink = CommitCallbackSink::new(&background, false);
        let future = CompletableResult::new();
        let mut state = state(
            ResultHandler::for_close(future.clone(), 1),
            AcknowledgeRequestType::Close,
            AckMap::new(),
        );
        assert!(state.needs_empty_close());
        assert!(!state.maybe_finish(&sink));

        let batches = state.prepare_send(0);
        assert!(batches.is_empty());
        state.on_success(5);
        assert!(state.maybe_finish(&sink));
        assert_eq!(future.try_get(), Some(Ok(())));
    }
}
