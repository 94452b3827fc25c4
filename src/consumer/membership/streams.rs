//! Streams group protocol flavor
//!
//! A streams member is assigned tasks rather than partitions. Each active
//! task `(subtopology, partition)` owns that partition of every source and
//! repartition-source topic of its subtopology; standby and warm-up tasks own
//! no input partitions.

use super::{HeartbeatContext, HeartbeatResponseData, MembershipFlavor, ResolvedAssignment};
use crate::consumer::events::{CallbackMethod, CallbackPayload};
use crate::consumer::heartbeat::HeartbeatSentFields;
use crate::consumer::metadata::MetadataView;
use crate::consumer::protocol::{
    RequestBody, ResponseBody, StreamsGroupHeartbeatRequest, StreamsTopology, TaskIds,
};
use crate::consumer::topic_partition::TopicPartition;
use crate::error::{ConsumerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    Active,
    Standby,
    Warmup,
}

/// A task of a subtopology
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamsTask {
    pub kind: TaskKind,
    pub subtopology_id: String,
    pub partition: i32,
}

impl StreamsTask {
    pub fn new(kind: TaskKind, subtopology_id: impl Into<String>, partition: i32) -> Self {
        Self {
            kind,
            subtopology_id: subtopology_id.into(),
            partition,
        }
    }
}

impl fmt::Display for StreamsTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}_{})", self.kind, self.subtopology_id, self.partition)
    }
}

type TasksBySubtopology = BTreeMap<String, BTreeSet<i32>>;

/// Active, standby and warm-up tasks keyed by subtopology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsAssignment {
    pub active: TasksBySubtopology,
    pub standby: TasksBySubtopology,
    pub warmup: TasksBySubtopology,
}

impl StreamsAssignment {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.standby.is_empty() && self.warmup.is_empty()
    }

    /// Every task, tagged with its kind
    pub fn tasks(&self) -> BTreeSet<StreamsTask> {
        let mut tasks = BTreeSet::new();
        for (kind, map) in [
            (TaskKind::Active, &self.active),
            (TaskKind::Standby, &self.standby),
            (TaskKind::Warmup, &self.warmup),
        ] {
            for (subtopology, partitions) in map {
                tasks.extend(
                    partitions
                        .iter()
                        .map(|p| StreamsTask::new(kind, subtopology.clone(), *p)),
                );
            }
        }
        tasks
    }
}

fn tasks_to_map(list: &[TaskIds]) -> TasksBySubtopology {
    let mut map = TasksBySubtopology::new();
    for entry in list {
        map.entry(entry.subtopology_id.clone())
            .or_default()
            .extend(entry.partitions.iter().copied());
    }
    map
}

fn tasks_from_map(map: &TasksBySubtopology) -> Vec<TaskIds> {
    map.iter()
        .map(|(subtopology_id, partitions)| TaskIds {
            subtopology_id: subtopology_id.clone(),
            partitions: partitions.iter().copied().collect(),
        })
        .collect()
}

/// Rebalance behavior of a streams application instance
#[derive(Debug, Clone)]
pub struct StreamsFlavor {
    topology: StreamsTopology,
    process_id: Uuid,
}

impl StreamsFlavor {
    pub fn new(topology: StreamsTopology, process_id: Uuid) -> Self {
        Self {
            topology,
            process_id,
        }
    }

    pub fn topology(&self) -> &StreamsTopology {
        &self.topology
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Input partitions owned through the active tasks
    fn partitions_for(&self, assignment: &StreamsAssignment) -> BTreeSet<TopicPartition> {
        let mut partitions = BTreeSet::new();
        for (subtopology_id, task_partitions) in &assignment.active {
            let Some(subtopology) = self
                .topology
                .subtopologies
                .iter()
                .find(|s| &s.subtopology_id == subtopology_id)
            else {
                warn!(
                    subtopology_id = %subtopology_id,
                    "Active task assigned for a subtopology missing from the local topology"
                );
                continue;
            };
            for topic in subtopology
                .source_topics
                .iter()
                .chain(subtopology.repartition_source_topics.iter())
            {
                partitions.extend(
                    task_partitions
                        .iter()
                        .map(|p| TopicPartition::new(topic.clone(), *p)),
                );
            }
        }
        partitions
    }
}

impl MembershipFlavor for StreamsFlavor {
    type Assignment = StreamsAssignment;

    const GROUP_TYPE: &'static str = "streams";

    fn resolve_assignment(
        &mut self,
        target: &Self::Assignment,
        _metadata: &mut dyn MetadataView,
    ) -> ResolvedAssignment<Self::Assignment> {
        ResolvedAssignment {
            assignment: target.clone(),
            partitions: self.partitions_for(target),
        }
    }

    fn callback_payload(
        &self,
        method: CallbackMethod,
        from: &Self::Assignment,
        to: &Self::Assignment,
        _partitions: &BTreeSet<TopicPartition>,
        _has_listener: bool,
    ) -> Option<CallbackPayload> {
        let tasks: BTreeSet<StreamsTask> = match method {
            CallbackMethod::Revoked => {
                let kept = to.tasks();
                from.tasks()
                    .into_iter()
                    .filter(|t| t.kind == TaskKind::Active && !kept.contains(t))
                    .collect()
            }
            CallbackMethod::Assigned => return Some(CallbackPayload::Tasks(to.tasks())),
            CallbackMethod::Lost => from.tasks(),
        };
        if tasks.is_empty() {
            return None;
        }
        Some(CallbackPayload::Tasks(tasks))
    }

    fn build_heartbeat_request(
        &self,
        context: &HeartbeatContext<'_, Self::Assignment>,
        sent: &mut HeartbeatSentFields<Self::Assignment>,
    ) -> RequestBody {
        let send_all = context.send_all_fields();
        let mut request = StreamsGroupHeartbeatRequest {
            group_id: context.group_id.to_string(),
            member_id: context.member_id.to_string(),
            member_epoch: context.member_epoch,
            rebalance_timeout_ms: -1,
            ..Default::default()
        };

        if send_all {
            request.instance_id = context.instance_id.map(str::to_string);
            request.rack_id = context.rack_id.map(str::to_string);
            request.rebalance_timeout_ms = context.rebalance_timeout_ms;
            request.topology = Some(self.topology.clone());
            request.process_id = Some(self.process_id);
            sent.rebalance_timeout_ms = Some(context.rebalance_timeout_ms);
        }

        if send_all || sent.local_assignment.as_ref() != Some(context.current_assignment) {
            let owned = context.current_assignment.assignment();
            request.active_tasks = Some(tasks_from_map(&owned.active));
            request.standby_tasks = Some(tasks_from_map(&owned.standby));
            request.warmup_tasks = Some(tasks_from_map(&owned.warmup));
            sent.local_assignment = Some(context.current_assignment.clone());
        }

        RequestBody::StreamsGroupHeartbeat(request)
    }

    fn parse_heartbeat_response(
        &self,
        response: ResponseBody,
    ) -> Result<HeartbeatResponseData<Self::Assignment>> {
        let r = match response {
            ResponseBody::StreamsGroupHeartbeat(r) => r,
            other => {
                return Err(ConsumerError::illegal_state(
                    "streams group heartbeat",
                    format!("unexpected {} response", other.api_name()),
                ))
            }
        };
        let assignment = match (&r.active_tasks, &r.standby_tasks, &r.warmup_tasks) {
            (Some(active), Some(standby), Some(warmup)) => Some(StreamsAssignment {
                active: tasks_to_map(active),
                standby: tasks_to_map(standby),
                warmup: tasks_to_map(warmup),
            }),
            (None, None, None) => None,
            _ => {
                return Err(ConsumerError::illegal_state(
                    "streams group heartbeat",
                    "invalid response data, task collections must be all null or all non-null",
                ))
            }
        };
        Ok(HeartbeatResponseData {
            error_code: r.error_code,
            error_message: r.error_message,
            member_id: r.member_id,
            member_epoch: r.member_epoch,
            heartbeat_interval_ms: r.heartbeat_interval_ms,
            assignment,
        })
    }
}
