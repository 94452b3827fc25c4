//! Typed group protocol messages
//!
//! These structs are the boundary with the wire codec: the engine builds
//! request bodies and reads response bodies, it never touches bytes. Topic
//! ids in share responses are already paired with their names by the codec
//! (it owns the session's id → name table).

use super::topic_partition::TopicIdPartition;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Member epoch sent by a dynamic member leaving the group
pub const LEAVE_GROUP_MEMBER_EPOCH: i32 = -1;

/// Member epoch sent by a static member leaving the group
pub const LEAVE_GROUP_STATIC_MEMBER_EPOCH: i32 = -2;

/// Member epoch sent when joining
pub const JOIN_GROUP_MEMBER_EPOCH: i32 = 0;

/// Leader id meaning "unknown"
pub const NO_LEADER: i32 = -1;

/// A broker node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

impl Node {
    pub fn new(id: i32, host: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            rack: None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (id: {})", self.host, self.port, self.id)
    }
}

/// Node endpoint returned alongside leadership hints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

impl From<&NodeEndpoint> for Node {
    fn from(endpoint: &NodeEndpoint) -> Self {
        Node {
            id: endpoint.node_id,
            host: endpoint.host.clone(),
            port: endpoint.port,
            rack: endpoint.rack.clone(),
        }
    }
}

/// Current leader hint carried in partition-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderIdAndEpoch {
    pub leader_id: i32,
    pub leader_epoch: i32,
}

impl LeaderIdAndEpoch {
    pub fn unknown() -> Self {
        Self {
            leader_id: NO_LEADER,
            leader_epoch: -1,
        }
    }

    pub fn new(leader_id: i32, leader_epoch: i32) -> Self {
        Self {
            leader_id,
            leader_epoch,
        }
    }

    /// Both id and epoch are set
    pub fn is_known(&self) -> bool {
        self.leader_id != NO_LEADER && self.leader_epoch != -1
    }
}

impl Default for LeaderIdAndEpoch {
    fn default() -> Self {
        Self::unknown()
    }
}

// ========== FindCoordinator ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCoordinatorRequest {
    /// Group id used as coordinator key
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCoordinatorResponse {
    pub key: String,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub node: Option<Node>,
}

impl FindCoordinatorResponse {
    pub fn found(key: impl Into<String>, node: Node) -> Self {
        Self {
            key: key.into(),
            error_code: 0,
            error_message: None,
            node: Some(node),
        }
    }

    pub fn error(key: impl Into<String>, error_code: i16) -> Self {
        Self {
            key: key.into(),
            error_code,
            error_message: None,
            node: None,
        }
    }
}

// ========== ConsumerGroupHeartbeat ==========

/// Partitions of one topic, keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPartitions {
    pub topic_id: Uuid,
    pub partitions: Vec<i32>,
}

/// Convert a per-id partition map into the repeated wire form
pub fn topic_partitions_from_map(map: &BTreeMap<Uuid, BTreeSet<i32>>) -> Vec<TopicPartitions> {
    map.iter()
        .map(|(topic_id, partitions)| TopicPartitions {
            topic_id: *topic_id,
            partitions: partitions.iter().copied().collect(),
        })
        .collect()
}

/// Convert the repeated wire form into a per-id partition map
pub fn topic_partitions_to_map(list: &[TopicPartitions]) -> BTreeMap<Uuid, BTreeSet<i32>> {
    let mut map: BTreeMap<Uuid, BTreeSet<i32>> = BTreeMap::new();
    for entry in list {
        map.entry(entry.topic_id)
            .or_default()
            .extend(entry.partitions.iter().copied());
    }
    map
}

/// Consumer Group Heartbeat Request (API Key 68)
///
/// Optional fields are only populated when they changed since the last
/// heartbeat, or on every field when joining.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerGroupHeartbeatRequest {
    pub group_id: String,
    pub member_id: String,
    pub member_epoch: i32,
    pub instance_id: Option<String>,
    pub rack_id: Option<String>,
    /// -1 when unchanged
    pub rebalance_timeout_ms: i32,
    pub subscribed_topic_names: Option<Vec<String>>,
    pub server_assignor: Option<String>,
    pub topic_partitions: Option<Vec<TopicPartitions>>,
}

/// Consumer Group Heartbeat Response (API Key 68)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerGroupHeartbeatResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub member_id: Option<String>,
    pub member_epoch: i32,
    pub heartbeat_interval_ms: i32,
    /// Target assignment, absent when unchanged
    pub assignment: Option<Vec<TopicPartitions>>,
}

// ========== ShareGroupHeartbeat ==========

/// Share Group Heartbeat Request (API Key 76)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareGroupHeartbeatRequest {
    pub group_id: String,
    pub member_id: String,
    pub member_epoch: i32,
    pub rack_id: Option<String>,
    pub subscribed_topic_names: Option<Vec<String>>,
}

/// Share Group Heartbeat Response (API Key 76)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareGroupHeartbeatResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub member_id: Option<String>,
    pub member_epoch: i32,
    pub heartbeat_interval_ms: i32,
    pub assignment: Option<Vec<TopicPartitions>>,
}

// ========== StreamsGroupHeartbeat ==========

/// Tasks of one subtopology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIds {
    pub subtopology_id: String,
    pub partitions: Vec<i32>,
}

/// Subtopology description sent when joining
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subtopology {
    pub subtopology_id: String,
    pub source_topics: Vec<String>,
    pub repartition_source_topics: Vec<String>,
}

/// Topology description sent when joining
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsTopology {
    pub epoch: i32,
    pub subtopologies: Vec<Subtopology>,
}

/// Streams Group Heartbeat Request (API Key 88)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsGroupHeartbeatRequest {
    pub group_id: String,
    pub member_id: String,
    pub member_epoch: i32,
    pub instance_id: Option<String>,
    pub rack_id: Option<String>,
    pub rebalance_timeout_ms: i32,
    pub topology: Option<StreamsTopology>,
    pub process_id: Option<Uuid>,
    pub active_tasks: Option<Vec<TaskIds>>,
    pub standby_tasks: Option<Vec<TaskIds>>,
    pub warmup_tasks: Option<Vec<TaskIds>>,
}

/// Streams Group Heartbeat Response (API Key 88)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsGroupHeartbeatResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub member_id: Option<String>,
    pub member_epoch: i32,
    pub heartbeat_interval_ms: i32,
    pub active_tasks: Option<Vec<TaskIds>>,
    pub standby_tasks: Option<Vec<TaskIds>>,
    pub warmup_tasks: Option<Vec<TaskIds>>,
}

// ========== ShareFetch / ShareAcknowledge ==========

/// Contiguous run of acknowledged offsets
///
/// `acknowledge_types` holds one entry per offset, or a single entry that
/// applies to the whole run. Type 0 marks a gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgementBatch {
    pub first_offset: i64,
    pub last_offset: i64,
    pub acknowledge_types: Vec<u8>,
}

/// A record delivered by a share fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// Offsets acquired by this member for a share fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredRecords {
    pub first_offset: i64,
    pub last_offset: i64,
    pub delivery_count: i16,
}

/// One partition in a share fetch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareFetchPartition {
    pub partition: TopicIdPartition,
    pub acknowledgement_batches: Vec<AcknowledgementBatch>,
}

/// Share Fetch Request (API Key 78)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareFetchRequest {
    pub group_id: String,
    pub member_id: String,
    pub share_session_epoch: i32,
    pub max_wait_ms: u32,
    pub min_bytes: u32,
    pub max_bytes: u32,
    pub max_records: u32,
    pub partitions: Vec<ShareFetchPartition>,
    pub forgotten: Vec<TopicIdPartition>,
}

/// Per-partition share fetch result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareFetchPartitionData {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub acknowledge_error_code: i16,
    pub acknowledge_error_message: Option<String>,
    pub current_leader: LeaderIdAndEpoch,
    pub records: Vec<Record>,
    pub acquired_records: Vec<AcquiredRecords>,
}

/// Share Fetch Response (API Key 78)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareFetchResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub partitions: BTreeMap<TopicIdPartition, ShareFetchPartitionData>,
    pub node_endpoints: Vec<NodeEndpoint>,
}

/// Share Acknowledge Request (API Key 79)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareAcknowledgeRequest {
    pub group_id: String,
    pub member_id: String,
    pub share_session_epoch: i32,
    pub acknowledgements: BTreeMap<TopicIdPartition, Vec<AcknowledgementBatch>>,
}

/// Per-partition share acknowledge result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareAcknowledgePartitionResponse {
    pub error_code: i16,
    pub error_message: Option<String>,
    pub current_leader: LeaderIdAndEpoch,
}

/// Share Acknowledge Response (API Key 79)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareAcknowledgeResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub partitions: BTreeMap<TopicIdPartition, ShareAcknowledgePartitionResponse>,
    pub node_endpoints: Vec<NodeEndpoint>,
}

// ========== Envelopes ==========

/// Any request the engine can send
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    FindCoordinator(FindCoordinatorRequest),
    ConsumerGroupHeartbeat(ConsumerGroupHeartbeatRequest),
    ShareGroupHeartbeat(ShareGroupHeartbeatRequest),
    StreamsGroupHeartbeat(StreamsGroupHeartbeatRequest),
    ShareFetch(ShareFetchRequest),
    ShareAcknowledge(ShareAcknowledgeRequest),
}

impl RequestBody {
    /// Protocol API name, used in logs
    pub fn api_name(&self) -> &'static str {
        match self {
            RequestBody::FindCoordinator(_) => "FindCoordinator",
            RequestBody::ConsumerGroupHeartbeat(_) => "ConsumerGroupHeartbeat",
            RequestBody::ShareGroupHeartbeat(_) => "ShareGroupHeartbeat",
            RequestBody::StreamsGroupHeartbeat(_) => "StreamsGroupHeartbeat",
            RequestBody::ShareFetch(_) => "ShareFetch",
            RequestBody::ShareAcknowledge(_) => "ShareAcknowledge",
        }
    }
}

/// Any response the engine can receive
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    FindCoordinator(FindCoordinatorResponse),
    ConsumerGroupHeartbeat(ConsumerGroupHeartbeatResponse),
    ShareGroupHeartbeat(ShareGroupHeartbeatResponse),
    StreamsGroupHeartbeat(StreamsGroupHeartbeatResponse),
    ShareFetch(ShareFetchResponse),
    ShareAcknowledge(ShareAcknowledgeResponse),
}

impl ResponseBody {
    pub fn api_name(&self) -> &'static str {
        match self {
            ResponseBody::FindCoordinator(_) => "FindCoordinator",
            ResponseBody::ConsumerGroupHeartbeat(_) => "ConsumerGroupHeartbeat",
            ResponseBody::ShareGroupHeartbeat(_) => "ShareGroupHeartbeat",
            ResponseBody::StreamsGroupHeartbeat(_) => "StreamsGroupHeartbeat",
            ResponseBody::ShareFetch(_) => "ShareFetch",
            ResponseBody::ShareAcknowledge(_) => "ShareAcknowledge",
        }
    }

    /// Top-level error code of the response
    pub fn error_code(&self) -> i16 {
        match self {
            ResponseBody::FindCoordinator(r) => r.error_code,
            ResponseBody::ConsumerGroupHeartbeat(r) => r.error_code,
            ResponseBody::ShareGroupHeartbeat(r) => r.error_code,
            ResponseBody::StreamsGroupHeartbeat(r) => r.error_code,
            ResponseBody::ShareFetch(r) => r.error_code,
            ResponseBody::ShareAcknowledge(r) => r.error_code,
        }
    }
}
