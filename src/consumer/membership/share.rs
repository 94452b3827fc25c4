//! Share group protocol flavor
//!
//! Share members have no static membership, no server assignor and no
//! rebalance callbacks: partitions are simply added and removed.

use super::consumer::{resolve_topic_ids, TopicIdAssignment};
use super::{HeartbeatContext, HeartbeatResponseData, MembershipFlavor, ResolvedAssignment};
use crate::consumer::events::{CallbackMethod, CallbackPayload};
use crate::consumer::heartbeat::HeartbeatSentFields;
use crate::consumer::metadata::MetadataView;
use crate::consumer::protocol::{
    topic_partitions_to_map, RequestBody, ResponseBody, ShareGroupHeartbeatRequest,
};
use crate::consumer::topic_partition::TopicPartition;
use crate::error::{ConsumerError, Result};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ShareFlavor {
    topic_names: BTreeMap<Uuid, String>,
}

impl ShareFlavor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MembershipFlavor for ShareFlavor {
    type Assignment = TopicIdAssignment;

    const GROUP_TYPE: &'static str = "share";

    fn supports_static_membership(&self) -> bool {
        false
    }

    fn resolve_assignment(
        &mut self,
        target: &Self::Assignment,
        metadata: &mut dyn MetadataView,
    ) -> ResolvedAssignment<Self::Assignment> {
        resolve_topic_ids(target, &mut self.topic_names, metadata)
    }

    fn callback_payload(
        &self,
        _method: CallbackMethod,
        _from: &Self::Assignment,
        _to: &Self::Assignment,
        _partitions: &BTreeSet<TopicPartition>,
        _has_listener: bool,
    ) -> Option<CallbackPayload> {
        None
    }

    fn build_heartbeat_request(
        &self,
        context: &HeartbeatContext<'_, Self::Assignment>,
        sent: &mut HeartbeatSentFields<Self::Assignment>,
    ) -> RequestBody {
        let send_all = context.send_all_fields();
        let mut request = ShareGroupHeartbeatRequest {
            group_id: context.group_id.to_string(),
            member_id: context.member_id.to_string(),
            member_epoch: context.member_epoch,
            ..Default::default()
        };
        if send_all {
            request.rack_id = context.rack_id.map(str::to_string);
        }
        if send_all || sent.subscribed_topics.as_ref() != Some(context.subscription) {
            request.subscribed_topic_names = Some(context.subscription.iter().cloned().collect());
            sent.subscribed_topics = Some(context.subscription.clone());
        }
        RequestBody::ShareGroupHeartbeat(request)
    }

    fn parse_heartbeat_response(
        &self,
        response: ResponseBody,
    ) -> Result<HeartbeatResponseData<Self::Assignment>> {
        match response {
            ResponseBody::ShareGroupHeartbeat(r) => Ok(HeartbeatResponseData {
                error_code: r.error_code,
                error_message: r.error_message,
                member_id: r.member_id,
                member_epoch: r.member_epoch,
                heartbeat_interval_ms: r.heartbeat_interval_ms,
                assignment: r.assignment.map(|a| topic_partitions_to_map(&a)),
            }),
            other => Err(ConsumerError::illegal_state(
                "share group heartbeat",
                format!("unexpected {} response", other.api_name()),
            )),
        }
    }
}
