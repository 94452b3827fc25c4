//! Share session state per broker
//!
//! The first fetch to a node opens a session with epoch 0 and lists every
//! partition. Each successful request bumps the epoch and later fetches only
//! carry partitions added to or forgotten from the session. Any session error
//! drops back to a fresh full session.

use crate::consumer::topic_partition::TopicIdPartition;
use std::collections::BTreeSet;
use tracing::debug;

/// Epoch of a request that opens a new session
pub const INITIAL_EPOCH: i32 = 0;

/// Epoch of a request that closes the session
pub const FINAL_EPOCH: i32 = -1;

/// Next epoch after a successful request, wrapping past `i32::MAX` to 1
pub fn next_epoch(epoch: i32) -> i32 {
    if epoch < 0 {
        return FINAL_EPOCH;
    }
    if epoch == i32::MAX {
        1
    } else {
        epoch + 1
    }
}

/// Partitions a fetch must list, and the ones the broker should forget
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFetchData {
    pub epoch: i32,
    pub to_send: BTreeSet<TopicIdPartition>,
    pub forgotten: BTreeSet<TopicIdPartition>,
}

#[derive(Debug, Clone)]
pub struct ShareSessionHandler {
    node_id: i32,
    epoch: i32,
    partitions: BTreeSet<TopicIdPartition>,
}

impl ShareSessionHandler {
    pub fn new(node_id: i32) -> Self {
        Self {
            node_id,
            epoch: INITIAL_EPOCH,
            partitions: BTreeSet::new(),
        }
    }

    pub fn node_id(&self) -> i32 {
        self.node_id
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    pub fn partitions(&self) -> &BTreeSet<TopicIdPartition> {
        &self.partitions
    }

    /// Build the fetch for `wanted` and adopt it as the session's partition set
    pub fn prepare_fetch(&mut self, wanted: BTreeSet<TopicIdPartition>) -> SessionFetchData {
        let data = if self.epoch == INITIAL_EPOCH {
            SessionFetchData {
                epoch: self.epoch,
                to_send: wanted.clone(),
                forgotten: BTreeSet::new(),
            }
        } else {
            SessionFetchData {
                epoch: self.epoch,
                to_send: wanted.difference(&self.partitions).cloned().collect(),
                forgotten: self.partitions.difference(&wanted).cloned().collect(),
            }
        };
        self.partitions = wanted;
        data
    }

    /// Successful response: move to the next epoch
    pub fn handle_response(&mut self) {
        self.epoch = next_epoch(self.epoch);
    }

    /// Session error or lost connection: next fetch opens a new session
    pub fn handle_error(&mut self) {
        debug!(node_id = self.node_id, epoch = self.epoch, "Resetting share session");
        self.epoch = INITIAL_EPOCH;
        self.partitions.clear();
    }

    /// The next request to this node closes the session
    pub fn notify_close(&mut self) {
        self.epoch = FINAL_EPOCH;
    }
}
