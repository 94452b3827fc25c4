//! Shared fixtures for streamline-client integration tests
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! # Features
//!
//! - Config and metadata fixtures for a two-broker cluster with an `orders` topic
//! - `ScriptedBroker`: a [`MockClient`] responder that plays coordinator and
//!   partition leader
//! - `LogCapture`: collects formatted tracing output for assertions
//! - `eventually`: polls a condition with a deadline

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamline_client::config::{AcknowledgementMode, ConsumerConfig};
use streamline_client::consumer::metadata::ClusterMetadata;
use streamline_client::consumer::protocol::{
    AcquiredRecords, ConsumerGroupHeartbeatResponse, FindCoordinatorResponse, Node, Record, RequestBody,
    ResponseBody, ShareAcknowledgePartitionResponse, ShareAcknowledgeResponse, ShareFetchPartitionData,
    ShareFetchResponse, ShareGroupHeartbeatResponse, TopicPartitions,
};
use streamline_client::testing::{MockClient, SharedMetadata};
use uuid::Uuid;

pub const GROUP_ID: &str = "integration-group";
pub const TOPIC: &str = "orders";
pub const HEARTBEAT_INTERVAL_MS: i32 = 50;

// ============================================================================
// Fixtures
// ============================================================================

pub fn node(id: i32) -> Node {
    Node::new(id, "localhost", 9091 + id)
}

/// Config with fixed backoff so retries are predictable
pub fn config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .group_id(GROUP_ID)
        .retry_backoff(100, 1_000)
        .retry_backoff_jitter(0.0)
        .default_api_timeout_ms(5_000)
        .build()
}

pub fn explicit_share_config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .group_id(GROUP_ID)
        .retry_backoff(20, 200)
        .retry_backoff_jitter(0.0)
        .default_api_timeout_ms(5_000)
        .share_acknowledgement_mode(AcknowledgementMode::Explicit)
        .build()
}

/// Brokers 1 and 2; `orders` has three partitions, 0 and 1 led by broker 1
/// and 2 led by broker 2
pub fn cluster(topic_id: Uuid) -> ClusterMetadata {
    let mut metadata = ClusterMetadata::new();
    metadata.add_node(node(1));
    metadata.add_node(node(2));
    metadata.update_topic(TOPIC, topic_id, &[(0, 1, 0), (1, 1, 0), (2, 2, 0)]);
    metadata
}

pub fn shared_cluster(topic_id: Uuid) -> SharedMetadata {
    SharedMetadata::new(cluster(topic_id))
}

/// Wait up to `timeout` for `condition`, calling `step` between checks
pub fn eventually(timeout: Duration, mut step: impl FnMut(), mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        step();
    }
    condition()
}

// ============================================================================
// Scripted Broker
// ============================================================================

/// Answers every request the engine sends, as a single-coordinator cluster
/// would
///
/// Heartbeats hand out the partitions in `target`; changing it moves the
/// member to a new target on its next heartbeat. Share fetches return three
/// records per partition on the first fetch of that partition and nothing
/// afterwards.
#[derive(Clone)]
pub struct ScriptedBroker {
    pub topic_id: Uuid,
    /// Member epoch and the partitions handed out with it
    pub target: Arc<Mutex<(i32, Vec<i32>)>>,
    pub fetches: Arc<AtomicUsize>,
    pub acknowledgements: Arc<Mutex<Vec<RequestBody>>>,
}

impl ScriptedBroker {
    pub fn new(topic_id: Uuid, partitions: &[i32]) -> Self {
        Self {
            topic_id,
            target: Arc::new(Mutex::new((1, partitions.to_vec()))),
            fetches: Arc::new(AtomicUsize::new(0)),
            acknowledgements: Arc::default(),
        }
    }

    /// Install this broker as the responder of `client`
    pub fn install(&self, client: &MockClient) {
        let broker = self.clone();
        let mut fetched = std::collections::BTreeSet::new();
        client.respond_with(move |node, body| broker.answer(node, body, &mut fetched));
    }

    /// Hand out a new assignment with a bumped epoch
    pub fn reassign(&self, partitions: &[i32]) {
        let mut target = self.target.lock();
        target.0 += 1;
        target.1 = partitions.to_vec();
    }

    fn target(&self) -> (i32, Vec<TopicPartitions>) {
        let (epoch, partitions) = self.target.lock().clone();
        (
            epoch,
            vec![TopicPartitions {
                topic_id: self.topic_id,
                partitions,
            }],
        )
    }

    fn answer(
        &self,
        node: &Node,
        body: &RequestBody,
        fetched: &mut std::collections::BTreeSet<streamline_client::consumer::TopicIdPartition>,
    ) -> Option<ResponseBody> {
        match body {
            RequestBody::FindCoordinator(request) => Some(ResponseBody::FindCoordinator(
                FindCoordinatorResponse::found(request.key.clone(), node.clone()),
            )),
            RequestBody::ConsumerGroupHeartbeat(request) => {
                let (epoch, target) = self.target();
                let leaving = request.member_epoch < 0;
                Some(ResponseBody::ConsumerGroupHeartbeat(ConsumerGroupHeartbeatResponse {
                    member_id: Some("member-1".to_string()),
                    member_epoch: if leaving { request.member_epoch } else { epoch },
                    heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
                    assignment: (!leaving).then_some(target),
                    ..Default::default()
                }))
            }
            RequestBody::ShareGroupHeartbeat(request) => {
                let (epoch, target) = self.target();
                let leaving = request.member_epoch < 0;
                Some(ResponseBody::ShareGroupHeartbeat(ShareGroupHeartbeatResponse {
                    member_id: Some("member-1".to_string()),
                    member_epoch: if leaving { request.member_epoch } else { epoch },
                    heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
                    assignment: (!leaving).then_some(target),
                    ..Default::default()
                }))
            }
            RequestBody::ShareFetch(request) => {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let mut partitions = BTreeMap::new();
                for wanted in &request.partitions {
                    let first = fetched.insert(wanted.partition.clone());
                    let data = if first { three_records() } else { ShareFetchPartitionData::default() };
                    partitions.insert(wanted.partition.clone(), data);
                }
                Some(ResponseBody::ShareFetch(ShareFetchResponse {
                    partitions,
                    ..Default::default()
                }))
            }
            RequestBody::ShareAcknowledge(request) => {
                self.acknowledgements.lock().push(body.clone());
                let partitions = request
                    .acknowledgements
                    .keys()
                    .map(|p| (p.clone(), ShareAcknowledgePartitionResponse::default()))
                    .collect();
                Some(ResponseBody::ShareAcknowledge(ShareAcknowledgeResponse {
                    partitions,
                    ..Default::default()
                }))
            }
            _ => None,
        }
    }
}

/// Offsets 0 to 2, acquired for the first time
pub fn three_records() -> ShareFetchPartitionData {
    ShareFetchPartitionData {
        records: (0..3)
            .map(|offset| Record {
                offset,
                timestamp_ms: 1_700_000_000_000 + offset,
                key: None,
                value: Some(bytes::Bytes::from(format!("value-{}", offset))),
            })
            .collect(),
        acquired_records: vec![AcquiredRecords {
            first_offset: 0,
            last_offset: 2,
            delivery_count: 1,
        }],
        ..Default::default()
    }
}

// ============================================================================
// Log Capture
// ============================================================================

#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    /// Run `f` with every event at `level` or above written to this capture
    pub fn run<R>(&self, level: tracing::Level, f: impl FnOnce() -> R) -> R {
        let buffer = Arc::clone(&self.buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(move || CaptureWriter(Arc::clone(&buffer)))
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}
