//! Subscription and assignment bookkeeping owned by the membership manager
//!
//! Assigned partitions carry two flags that pause fetching while a rebalance
//! callback is outstanding: `pending_revocation` (about to be taken away) and
//! `awaiting_callback` (newly added, not yet confirmed by the assign callback).

use super::topic_partition::TopicPartition;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PartitionState {
    pending_revocation: bool,
    awaiting_callback: bool,
}

/// Subscribed topics and the partitions currently assigned from them
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    subscription: BTreeSet<String>,
    assignment: BTreeMap<TopicPartition, PartitionState>,
    has_rebalance_listener: bool,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the subscription; returns true when it changed
    pub fn subscribe(&mut self, topics: BTreeSet<String>, has_rebalance_listener: bool) -> bool {
        self.has_rebalance_listener = has_rebalance_listener;
        if self.subscription == topics {
            return false;
        }
        self.subscription = topics;
        true
    }

    /// Drop the subscription and every assigned partition
    pub fn unsubscribe(&mut self) {
        self.subscription.clear();
        self.assignment.clear();
    }

    pub fn subscription(&self) -> &BTreeSet<String> {
        &self.subscription
    }

    pub fn has_auto_assigned_partitions(&self) -> bool {
        !self.subscription.is_empty()
    }

    pub fn has_rebalance_listener(&self) -> bool {
        self.has_rebalance_listener
    }

    pub fn assigned_partitions(&self) -> BTreeSet<TopicPartition> {
        self.assignment.keys().cloned().collect()
    }

    /// Assigned partitions whose assign callback has completed
    pub fn enabled_partitions(&self) -> BTreeSet<TopicPartition> {
        self.assignment
            .iter()
            .filter(|(_, s)| !s.awaiting_callback)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn num_assigned_partitions(&self) -> usize {
        self.assignment.len()
    }

    pub fn is_assigned(&self, partition: &TopicPartition) -> bool {
        self.assignment.contains_key(partition)
    }

    /// Pause fetching from partitions that are about to be revoked
    pub fn mark_pending_revocation(&mut self, partitions: &BTreeSet<TopicPartition>) {
        for partition in partitions {
            if let Some(state) = self.assignment.get_mut(partition) {
                state.pending_revocation = true;
            }
        }
    }

    /// Install a new full assignment; `added` partitions stay disabled until
    /// [`enable_partitions_awaiting_callback`](Self::enable_partitions_awaiting_callback)
    pub fn assign_from_subscribed_awaiting_callback(
        &mut self,
        assigned: &BTreeSet<TopicPartition>,
        added: &BTreeSet<TopicPartition>,
    ) {
        let mut next = BTreeMap::new();
        for partition in assigned {
            let state = if added.contains(partition) {
                PartitionState {
                    pending_revocation: false,
                    awaiting_callback: true,
                }
            } else {
                let previous = self.assignment.get(partition).copied().unwrap_or_default();
                PartitionState {
                    pending_revocation: false,
                    awaiting_callback: previous.awaiting_callback,
                }
            };
            next.insert(partition.clone(), state);
        }
        self.assignment = next;
    }

    /// Enable partitions once the assign callback succeeded
    pub fn enable_partitions_awaiting_callback(&mut self, partitions: &BTreeSet<TopicPartition>) {
        for partition in partitions {
            if let Some(state) = self.assignment.get_mut(partition) {
                state.awaiting_callback = false;
            }
        }
    }

    /// Install an assignment with every partition enabled
    pub fn assign_from_subscribed(&mut self, partitions: &BTreeSet<TopicPartition>) {
        self.assignment = partitions
            .iter()
            .map(|p| (p.clone(), PartitionState::default()))
            .collect();
    }

    /// Partition is assigned and not paused by a pending callback
    pub fn is_fetchable(&self, partition: &TopicPartition) -> bool {
        self.assignment
            .get(partition)
            .map(|s| !s.pending_revocation && !s.awaiting_callback)
            .unwrap_or(false)
    }

    pub fn fetchable_partitions(&self) -> Vec<TopicPartition> {
        self.assignment
            .iter()
            .filter(|(_, s)| !s.pending_revocation && !s.awaiting_callback)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tps(partitions: &[i32]) -> BTreeSet<TopicPartition> {
        partitions.iter().map(|p| TopicPartition::new("t", *p)).collect()
    }

    #[test]
    fn test_subscribe_reports_change() {
        let mut state = SubscriptionState::new();
        assert!(state.subscribe(BTreeSet::from(["t".to_string()]), false));
        assert!(!state.subscribe(BTreeSet::from(["t".to_string()]), true));
        assert!(state.has_rebalance_listener());
        assert!(state.has_auto_assigned_partitions());
    }

    #[test]
    fn test_awaiting_callback_blocks_fetch_until_enabled() {
        let mut state = SubscriptionState::new();
        state.assign_from_subscribed(&tps(&[0]));
        state.assign_from_subscribed_awaiting_callback(&tps(&[0, 1]), &tps(&[1]));

        assert!(state.is_fetchable(&TopicPartition::new("t", 0)));
        assert!(!state.is_fetchable(&TopicPartition::new("t", 1)));

        state.enable_partitions_awaiting_callback(&tps(&[1]));
        assert_eq!(state.fetchable_partitions().len(), 2);
    }

    #[test]
    fn test_pending_revocation_pauses_and_reassign_drops() {
        let mut state = SubscriptionState::new();
        state.assign_from_subscribed(&tps(&[0, 1]));
        state.mark_pending_revocation(&tps(&[1]));
        assert_eq!(state.fetchable_partitions(), vec![TopicPartition::new("t", 0)]);

        state.assign_from_subscribed_awaiting_callback(&tps(&[0]), &BTreeSet::new());
        assert_eq!(state.assigned_partitions(), tps(&[0]));
        assert!(state.is_fetchable(&TopicPartition::new("t", 0)));
    }

    #[test]
    fn test_unsubscribe_clears_everything() {
        let mut state = SubscriptionState::new();
        state.subscribe(BTreeSet::from(["t".to_string()]), false);
        state.assign_from_subscribed(&tps(&[0]));
        state.unsubscribe();
        assert!(state.subscription().is_empty());
        assert_eq!(state.num_assigned_partitions(), 0);
    }
}
