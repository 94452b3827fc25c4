//! Cluster metadata view
//!
//! The engine only reads leaders, node endpoints and topic id/name pairs, and
//! flags when a refresh is needed. Fetching metadata is done elsewhere; its
//! results are applied to [`ClusterMetadata`].

use super::protocol::{LeaderIdAndEpoch, Node, NO_LEADER};
use super::topic_partition::TopicPartition;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

/// Leader node and epoch for a partition
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaderAndEpoch {
    pub leader: Option<Node>,
    pub epoch: Option<i32>,
}

/// Read access to metadata plus the update-request flag
pub trait MetadataView {
    fn node_by_id(&self, node_id: i32) -> Option<Node>;

    fn current_leader(&self, partition: &TopicPartition) -> LeaderAndEpoch;

    fn topic_id(&self, topic: &str) -> Option<Uuid>;

    fn topic_name(&self, topic_id: &Uuid) -> Option<String>;

    /// Partition ids of a topic, empty when unknown
    fn partitions_for_topic(&self, topic: &str) -> Vec<i32>;

    /// Ask for a metadata refresh
    fn request_update(&mut self);

    fn update_requested(&self) -> bool;

    /// Apply leader hints from a response, returning the partitions whose
    /// leader actually changed. Hints with an epoch older than the cached one
    /// are ignored.
    fn update_partition_leadership(
        &mut self,
        leaders: &BTreeMap<TopicPartition, LeaderIdAndEpoch>,
        nodes: &[Node],
    ) -> BTreeSet<TopicPartition>;
}

#[derive(Debug, Clone, Default)]
struct TopicMetadata {
    topic_id: Uuid,
    leaders: BTreeMap<i32, (i32, i32)>,
}

/// In-memory metadata cache
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    nodes: BTreeMap<i32, Node>,
    topics: BTreeMap<String, TopicMetadata>,
    update_requested: bool,
}

impl ClusterMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    pub fn remove_node(&mut self, node_id: i32) {
        self.nodes.remove(&node_id);
    }

    /// Register or replace a topic with `(partition, leader_id, leader_epoch)` entries
    pub fn update_topic(&mut self, topic: impl Into<String>, topic_id: Uuid, partitions: &[(i32, i32, i32)]) {
        let leaders = partitions
            .iter()
            .map(|(partition, leader, epoch)| (*partition, (*leader, *epoch)))
            .collect();
        self.topics
            .insert(topic.into(), TopicMetadata { topic_id, leaders });
    }

    /// Move a partition to a new leader, bumping its epoch
    pub fn set_leader(&mut self, partition: &TopicPartition, leader_id: i32) {
        if let Some(topic) = self.topics.get_mut(&partition.topic) {
            let entry = topic
                .leaders
                .entry(partition.partition)
                .or_insert((NO_LEADER, 0));
            entry.0 = leader_id;
            entry.1 += 1;
        }
    }

    /// Clear the update flag once a refresh has been applied
    pub fn clear_update_request(&mut self) {
        self.update_requested = false;
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}

impl MetadataView for ClusterMetadata {
    fn node_by_id(&self, node_id: i32) -> Option<Node> {
        self.nodes.get(&node_id).cloned()
    }

    fn current_leader(&self, partition: &TopicPartition) -> LeaderAndEpoch {
        let entry = self
            .topics
            .get(&partition.topic)
            .and_then(|t| t.leaders.get(&partition.partition));
        match entry {
            Some((leader_id, epoch)) => LeaderAndEpoch {
                leader: self.nodes.get(leader_id).cloned(),
                epoch: Some(*epoch),
            },
            None => LeaderAndEpoch::default(),
        }
    }

    fn topic_id(&self, topic: &str) -> Option<Uuid> {
        self.topics.get(topic).map(|t| t.topic_id)
    }

    fn topic_name(&self, topic_id: &Uuid) -> Option<String> {
        self.topics
            .iter()
            .find(|(_, t)| &t.topic_id == topic_id)
            .map(|(name, _)| name.clone())
    }

    fn partitions_for_topic(&self, topic: &str) -> Vec<i32> {
        self.topics
            .get(topic)
            .map(|t| t.leaders.keys().copied().collect())
            .unwrap_or_default()
    }

    fn request_update(&mut self) {
        self.update_requested = true;
    }

    fn update_requested(&self) -> bool {
        self.update_requested
    }

    fn update_partition_leadership(
        &mut self,
        leaders: &BTreeMap<TopicPartition, LeaderIdAndEpoch>,
        nodes: &[Node],
    ) -> BTreeSet<TopicPartition> {
        for node in nodes {
            self.nodes.insert(node.id, node.clone());
        }

        let mut updated = BTreeSet::new();
        for (partition, hint) in leaders {
            let Some(topic) = self.topics.get_mut(&partition.topic) else {
                debug!(partition = %partition, "Ignoring leader hint for unknown topic");
                continue;
            };
            let current = topic.leaders.get(&partition.partition).copied();
            let newer = match current {
                Some((_, epoch)) => hint.leader_epoch > epoch,
                None => true,
            };
            if newer && self.nodes.contains_key(&hint.leader_id) {
                topic
                    .leaders
                    .insert(partition.partition, (hint.leader_id, hint.leader_epoch));
                updated.insert(partition.clone());
            } else {
                debug!(
                    partition = %partition,
                    leader_id = hint.leader_id,
                    leader_epoch = hint.leader_epoch,
                    "Ignoring stale or unresolvable leader hint"
                );
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> (ClusterMetadata, Uuid) {
        let id = Uuid::new_v4();
        let mut metadata = ClusterMetadata::new();
        metadata.add_node(Node::new(1, "broker-1", 9092));
        metadata.add_node(Node::new(2, "broker-2", 9092));
        metadata.update_topic("orders", id, &[(0, 1, 5), (1, 2, 3)]);
        (metadata, id)
    }

    #[test]
    fn test_lookups() {
        let (metadata, id) = metadata();
        assert_eq!(metadata.topic_id("orders"), Some(id));
        assert_eq!(metadata.topic_name(&id).as_deref(), Some("orders"));
        assert_eq!(metadata.partitions_for_topic("orders"), vec![0, 1]);

        let leader = metadata.current_leader(&TopicPartition::new("orders", 1));
        assert_eq!(leader.leader.map(|n| n.id), Some(2));
        assert_eq!(leader.epoch, Some(3));
        assert!(metadata
            .current_leader(&TopicPartition::new("missing", 0))
            .leader
            .is_none());
    }

    #[test]
    fn test_leadership_update_requires_newer_epoch() {
        let (mut metadata, _) = metadata();
        let tp = TopicPartition::new("orders", 0);

        let stale = BTreeMap::from([(tp.clone(), LeaderIdAndEpoch::new(2, 4))]);
        assert!(metadata.update_partition_leadership(&stale, &[]).is_empty());

        let newer = BTreeMap::from([(tp.clone(), LeaderIdAndEpoch::new(3, 6))]);
        let nodes = vec![Node::new(3, "broker-3", 9092)];
        let updated = metadata.update_partition_leadership(&newer, &nodes);
        assert!(updated.contains(&tp));
        assert_eq!(metadata.current_leader(&tp).leader.map(|n| n.id), Some(3));
    }

    #[test]
    fn test_update_flag() {
        let (mut metadata, _) = metadata();
        assert!(!metadata.update_requested());
        metadata.request_update();
        assert!(metadata.update_requested());
        metadata.clear_update_request();
        assert!(!metadata.update_requested());
    }
}
