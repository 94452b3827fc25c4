//! Consumer group protocol flavor

use super::{
    HeartbeatContext, HeartbeatResponseData, MembershipFlavor, ResolvedAssignment,
};
use crate::consumer::events::{CallbackMethod, CallbackPayload};
use crate::consumer::heartbeat::HeartbeatSentFields;
use crate::consumer::metadata::MetadataView;
use crate::consumer::protocol::{
    topic_partitions_from_map, topic_partitions_to_map, ConsumerGroupHeartbeatRequest,
    RequestBody, ResponseBody,
};
use crate::consumer::topic_partition::TopicPartition;
use crate::error::{ConsumerError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

/// Partitions per topic id, as carried by consumer group heartbeats
pub type TopicIdAssignment = BTreeMap<Uuid, BTreeSet<i32>>;

/// Rebalance behavior of a classic consumer in a consumer group
#[derive(Debug, Default)]
pub struct ConsumerFlavor {
    /// Names of topic ids seen before, kept so a topic deleted from
    /// metadata can still be revoked by name
    topic_names: BTreeMap<Uuid, String>,
}

impl ConsumerFlavor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve topic ids to names, requesting a metadata update for unknown ids
pub(crate) fn resolve_topic_ids(
    target: &TopicIdAssignment,
    topic_names: &mut BTreeMap<Uuid, String>,
    metadata: &mut dyn MetadataView,
) -> ResolvedAssignment<TopicIdAssignment> {
    let mut assignment = TopicIdAssignment::new();
    let mut partitions = BTreeSet::new();
    let mut unresolved = Vec::new();

    for (topic_id, ids) in target {
        let name = metadata
            .topic_name(topic_id)
            .or_else(|| topic_names.get(topic_id).cloned());
        match name {
            Some(name) => {
                topic_names.insert(*topic_id, name.clone());
                partitions.extend(ids.iter().map(|p| TopicPartition::new(name.clone(), *p)));
                assignment.insert(*topic_id, ids.clone());
            }
            None => unresolved.push(*topic_id),
        }
    }

    if !unresolved.is_empty() {
        debug!(
            unresolved = ?unresolved,
            "Topic ids in the target assignment not found in metadata, requesting update"
        );
        metadata.request_update();
    }

    ResolvedAssignment {
        assignment,
        partitions,
    }
}

impl MembershipFlavor for ConsumerFlavor {
    type Assignment = TopicIdAssignment;

    const GROUP_TYPE: &'static str = "consumer";

    fn resolve_assignment(
        &mut self,
        target: &Self::Assignment,
        metadata: &mut dyn MetadataView,
    ) -> ResolvedAssignment<Self::Assignment> {
        resolve_topic_ids(target, &mut self.topic_names, metadata)
    }

    fn callback_payload(
        &self,
        method: CallbackMethod,
        _from: &Self::Assignment,
        _to: &Self::Assignment,
        partitions: &BTreeSet<TopicPartition>,
        has_listener: bool,
    ) -> Option<CallbackPayload> {
        if !has_listener {
            return None;
        }
        // The assigned callback runs even with nothing added
        if method != CallbackMethod::Assigned && partitions.is_empty() {
            return None;
        }
        Some(CallbackPayload::Partitions(partitions.clone()))
    }

    fn build_heartbeat_request(
        &self,
        context: &HeartbeatContext<'_, Self::Assignment>,
        sent: &mut HeartbeatSentFields<Self::Assignment>,
    ) -> RequestBody {
        let send_all = context.send_all_fields();
        let mut request = ConsumerGroupHeartbeatRequest {
            group_id: context.group_id.to_string(),
            member_id: context.member_id.to_string(),
            member_epoch: context.member_epoch,
            instance_id: context.instance_id.map(str::to_string),
            rebalance_timeout_ms: -1,
            ..Default::default()
        };

        if send_all || sent.rebalance_timeout_ms != Some(context.rebalance_timeout_ms) {
            request.rebalance_timeout_ms = context.rebalance_timeout_ms;
            sent.rebalance_timeout_ms = Some(context.rebalance_timeout_ms);
        }

        if send_all || sent.subscribed_topics.as_ref() != Some(context.subscription) {
            request.subscribed_topic_names = Some(context.subscription.iter().cloned().collect());
            sent.subscribed_topics = Some(context.subscription.clone());
        }

        if let Some(assignor) = context.server_assignor {
            if send_all || sent.server_assignor.as_deref() != Some(assignor) {
                request.server_assignor = Some(assignor.to_string());
                sent.server_assignor = Some(assignor.to_string());
            }
        }

        if send_all {
            request.rack_id = context.rack_id.map(str::to_string);
        }

        if send_all || sent.local_assignment.as_ref() != Some(context.current_assignment) {
            request.topic_partitions = Some(topic_partitions_from_map(
                context.current_assignment.assignment(),
            ));
            sent.local_assignment = Some(context.current_assignment.clone());
        }

        RequestBody::ConsumerGroupHeartbeat(request)
    }

    fn parse_heartbeat_response(
        &self,
        response: ResponseBody,
    ) -> Result<HeartbeatResponseData<Self::Assignment>> {
        match response {
            ResponseBody::ConsumerGroupHeartbeat(r) => Ok(HeartbeatResponseData {
                error_code: r.error_code,
                error_message: r.error_message,
                member_id: r.member_id,
                member_epoch: r.member_epoch,
                heartbeat_interval_ms: r.heartbeat_interval_ms,
                assignment: r.assignment.map(|a| topic_partitions_to_map(&a)),
            }),
            other => Err(ConsumerError::illegal_state(
                "consumer group heartbeat",
                format!("unexpected {} response", other.api_name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::membership::{LocalAssignment, MemberState};
    use crate::consumer::metadata::ClusterMetadata;
    use crate::consumer::protocol::{ConsumerGroupHeartbeatResponse, TopicPartitions};

    fn context<'a>(
        state: MemberState,
        subscription: &'a BTreeSet<String>,
        current: &'a LocalAssignment<TopicIdAssignment>,
    ) -> HeartbeatContext<'a, TopicIdAssignment> {
        HeartbeatContext {
            group_id: "group",
            member_id: "member",
            member_epoch: 5,
            state,
            instance_id: Some("instance-1"),
            rack_id: Some("rack-a"),
            server_assignor: Some("uniform"),
            rebalance_timeout_ms: 30_000,
            subscription,
            current_assignment: current,
        }
    }

    fn consumer_request(body: RequestBody) -> ConsumerGroupHeartbeatRequest {
        match body {
            RequestBody::ConsumerGroupHeartbeat(r) => r,
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_joining_sends_all_fields() {
        let flavor = ConsumerFlavor::new();
        let topics = BTreeSet::from(["orders".to_string()]);
        let current = LocalAssignment::none();
        let mut sent = HeartbeatSentFields::default();

        let request = consumer_request(
            flavor.build_heartbeat_request(&context(MemberState::Joining, &topics, &current), &mut sent),
        );
        assert_eq!(request.instance_id.as_deref(), Some("instance-1"));
        assert_eq!(request.rack_id.as_deref(), Some("rack-a"));
        assert_eq!(request.rebalance_timeout_ms, 30_000);
        assert_eq!(request.subscribed_topic_names, Some(vec!["orders".to_string()]));
        assert_eq!(request.server_assignor.as_deref(), Some("uniform"));
        assert_eq!(request.topic_partitions, Some(vec![]));
    }

    #[test]
    fn test_stable_sends_only_changes() {
        let flavor = ConsumerFlavor::new();
        let topics = BTreeSet::from(["orders".to_string()]);
        let current = LocalAssignment::none();
        let mut sent = HeartbeatSentFields::default();
        flavor.build_heartbeat_request(&context(MemberState::Joining, &topics, &current), &mut sent);

        let request = consumer_request(
            flavor.build_heartbeat_request(&context(MemberState::Stable, &topics, &current), &mut sent),
        );
        assert_eq!(request.instance_id.as_deref(), Some("instance-1"));
        assert_eq!(request.rack_id, None);
        assert_eq!(request.rebalance_timeout_ms, -1);
        assert_eq!(request.subscribed_topic_names, None);
        assert_eq!(request.server_assignor, None);
        assert_eq!(request.topic_partitions, None);

        let id = Uuid::new_v4();
        let reconciled = LocalAssignment::new(0, BTreeMap::from([(id, BTreeSet::from([1]))]));
        let request = consumer_request(flavor.build_heartbeat_request(
            &context(MemberState::Acknowledging, &topics, &reconciled),
            &mut sent,
        ));
        assert_eq!(
            request.topic_partitions,
            Some(vec![TopicPartitions {
                topic_id: id,
                partitions: vec![1]
            }])
        );

        sent.reset();
        let request = consumer_request(
            flavor.build_heartbeat_request(&context(MemberState::Stable, &topics, &reconciled), &mut sent),
        );
        assert!(request.subscribed_topic_names.is_some());
        assert!(request.topic_partitions.is_some());
    }

    #[test]
    fn test_resolution_uses_name_cache() {
        let mut flavor = ConsumerFlavor::new();
        let id = Uuid::new_v4();
        let mut metadata = ClusterMetadata::new();
        metadata.update_topic("orders", id, &[(0, 1, 0)]);
        let target = BTreeMap::from([(id, BTreeSet::from([0]))]);

        let resolved = flavor.resolve_assignment(&target, &mut metadata);
        assert_eq!(resolved.partitions, BTreeSet::from([TopicPartition::new("orders", 0)]));

        let mut empty = ClusterMetadata::new();
        let resolved = flavor.resolve_assignment(&target, &mut empty);
        assert_eq!(resolved.assignment, target);
        assert!(!empty.update_requested());

        let unknown = BTreeMap::from([(Uuid::new_v4(), BTreeSet::from([3]))]);
        let resolved = flavor.resolve_assignment(&unknown, &mut empty);
        assert!(resolved.partitions.is_empty());
        assert!(empty.update_requested());
    }

    #[test]
    fn test_callbacks_need_a_listener() {
        let flavor = ConsumerFlavor::new();
        let none = TopicIdAssignment::new();
        let partitions = BTreeSet::from([TopicPartition::new("orders", 0)]);
        assert!(flavor
            .callback_payload(CallbackMethod::Revoked, &none, &none, &partitions, false)
            .is_none());
        assert!(flavor
            .callback_payload(CallbackMethod::Lost, &none, &none, &BTreeSet::new(), true)
            .is_none());
        assert_eq!(
            flavor.callback_payload(CallbackMethod::Assigned, &none, &none, &BTreeSet::new(), true),
            Some(CallbackPayload::Partitions(BTreeSet::new()))
        );
    }

    #[test]
    fn test_parse_response() {
        let flavor = ConsumerFlavor::new();
        let id = Uuid::new_v4();
        let data = flavor
            .parse_heartbeat_response(ResponseBody::ConsumerGroupHeartbeat(
                ConsumerGroupHeartbeatResponse {
                    member_epoch: 3,
                    heartbeat_interval_ms: 2_000,
                    assignment: Some(vec![TopicPartitions {
                        topic_id: id,
                        partitions: vec![0, 1],
                    }]),
                    ..Default::default()
                },
            ))
            .unwrap();
        assert_eq!(data.member_epoch, 3);
        assert_eq!(data.assignment.unwrap()[&id], BTreeSet::from([0, 1]));

        let wrong = ResponseBody::ShareGroupHeartbeat(Default::default());
        assert!(matches!(
            flavor.parse_heartbeat_response(wrong),
            Err(ConsumerError::IllegalState(_))
        ));
    }
}
