//! Topic partition identifiers
//!
//! Share and consumer group assignments are keyed by topic id on the wire;
//! `TopicIdPartition` carries both the id and the resolved name so managers
//! can talk to metadata (by name) and brokers (by id) without re-resolving.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// A partition of a named topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A topic partition with its topic id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicIdPartition {
    pub topic_id: Uuid,
    pub topic_partition: TopicPartition,
}

impl TopicIdPartition {
    pub fn new(topic_id: Uuid, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic_id,
            topic_partition: TopicPartition::new(topic, partition),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic_partition.topic
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition
    }
}

impl fmt::Display for TopicIdPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic_id, self.topic_partition)
    }
}

/// Ordered set of topic id partitions with lookups by id and by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicIdPartitionSet {
    partitions: BTreeSet<TopicIdPartition>,
}

impl TopicIdPartitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partition, returning false if it was already present
    pub fn add(&mut self, topic_id: Uuid, topic: impl Into<String>, partition: i32) -> bool {
        self.partitions
            .insert(TopicIdPartition::new(topic_id, topic, partition))
    }

    pub fn insert(&mut self, tip: TopicIdPartition) -> bool {
        self.partitions.insert(tip)
    }

    pub fn contains(&self, tip: &TopicIdPartition) -> bool {
        self.partitions.contains(tip)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicIdPartition> {
        self.partitions.iter()
    }

    /// Distinct topic ids in the set
    pub fn topic_ids(&self) -> BTreeSet<Uuid> {
        self.partitions.iter().map(|p| p.topic_id).collect()
    }

    /// Distinct topic names in the set
    pub fn topic_names(&self) -> BTreeSet<String> {
        self.partitions.iter().map(|p| p.topic().to_string()).collect()
    }

    /// Partitions owned per topic id, the shape used by heartbeat requests
    pub fn to_partitions_by_topic_id(&self) -> BTreeMap<Uuid, BTreeSet<i32>> {
        let mut by_id: BTreeMap<Uuid, BTreeSet<i32>> = BTreeMap::new();
        for tip in &self.partitions {
            by_id.entry(tip.topic_id).or_default().insert(tip.partition());
        }
        by_id
    }

    pub fn to_topic_partitions(&self) -> BTreeSet<TopicPartition> {
        self.partitions
            .iter()
            .map(|p| p.topic_partition.clone())
            .collect()
    }
}

impl FromIterator<TopicIdPartition> for TopicIdPartitionSet {
    fn from_iter<I: IntoIterator<Item = TopicIdPartition>>(iter: I) -> Self {
        Self {
            partitions: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a TopicIdPartitionSet {
    type Item = &'a TopicIdPartition;
    type IntoIter = std::collections::btree_set::Iter<'a, TopicIdPartition>;

    fn into_iter(self) -> Self::IntoIter {
        self.partitions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(TopicPartition::new("orders", 3).to_string(), "orders-3");
    }

    #[test]
    fn test_set_groups_by_topic_id() {
        let orders = Uuid::new_v4();
        let payments = Uuid::new_v4();
        let mut set = TopicIdPartitionSet::new();
        assert!(set.add(orders, "orders", 0));
        assert!(set.add(orders, "orders", 2));
        assert!(set.add(payments, "payments", 1));
        assert!(!set.add(orders, "orders", 0));

        assert_eq!(set.len(), 3);
        let by_id = set.to_partitions_by_topic_id();
        assert_eq!(by_id[&orders], BTreeSet::from([0, 2]));
        assert_eq!(by_id[&payments], BTreeSet::from([1]));
        assert_eq!(
            set.topic_names(),
            BTreeSet::from(["orders".to_string(), "payments".to_string()])
        );
    }

    #[test]
    fn test_set_to_topic_partitions() {
        let id = Uuid::new_v4();
        let set: TopicIdPartitionSet = vec![
            TopicIdPartition::new(id, "t", 1),
            TopicIdPartition::new(id, "t", 0),
        ]
        .into_iter()
        .collect();
        let tps: Vec<_> = set.to_topic_partitions().into_iter().collect();
        assert_eq!(tps, vec![TopicPartition::new("t", 0), TopicPartition::new("t", 1)]);
        assert!(set.contains(&TopicIdPartition::new(id, "t", 1)));
    }
}
