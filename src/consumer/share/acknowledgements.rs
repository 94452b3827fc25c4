//! Per-partition acknowledgement sets
//!
//! Offsets map to an [`AcknowledgeType`] or to `None` for a gap (an offset
//! that was never delivered, e.g. a compacted record). On the wire they are
//! compressed into runs of consecutive offsets.

use crate::consumer::protocol::AcknowledgementBatch;
use crate::error::ConsumerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wire value of a gap
pub const ACKNOWLEDGE_TYPE_GAP: u8 = 0;

/// How a delivered record is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AcknowledgeType {
    /// Processed successfully
    Accept = 1,
    /// Make available for another delivery
    Release = 2,
    /// Not processable, never deliver again
    Reject = 3,
}

impl AcknowledgeType {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(AcknowledgeType::Accept),
            2 => Some(AcknowledgeType::Release),
            3 => Some(AcknowledgeType::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for AcknowledgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcknowledgeType::Accept => "ACCEPT",
            AcknowledgeType::Release => "RELEASE",
            AcknowledgeType::Reject => "REJECT",
        };
        f.write_str(name)
    }
}

/// Acknowledgements of one partition, plus the outcome once delivered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acknowledgements {
    acknowledgements: BTreeMap<i64, Option<AcknowledgeType>>,
    completed: bool,
    error: Option<ConsumerError>,
}

impl Acknowledgements {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Acknowledge one offset; a later call for the same offset wins
    pub fn add(&mut self, offset: i64, acknowledge_type: AcknowledgeType) {
        self.acknowledgements.insert(offset, Some(acknowledge_type));
    }

    pub fn add_gap(&mut self, offset: i64) {
        self.acknowledgements.insert(offset, None);
    }

    /// `Some(None)` for a gap, `None` when the offset is not present
    pub fn get(&self, offset: i64) -> Option<Option<AcknowledgeType>> {
        self.acknowledgements.get(&offset).copied()
    }

    pub fn len(&self) -> usize {
        self.acknowledgements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acknowledgements.is_empty()
    }

    pub fn offsets(&self) -> impl Iterator<Item = (i64, Option<AcknowledgeType>)> + '_ {
        self.acknowledgements.iter().map(|(o, t)| (*o, *t))
    }

    /// Fold `other` in; offsets present in both take `other`'s type
    pub fn merge(&mut self, other: Acknowledgements) {
        self.acknowledgements.extend(other.acknowledgements);
    }

    /// Record the outcome; only the first completion counts
    pub fn complete(&mut self, error: Option<ConsumerError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.error = error;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn error(&self) -> Option<&ConsumerError> {
        self.error.as_ref()
    }

    /// Compress into runs of consecutive offsets. A run whose offsets all
    /// share a type carries that type once.
    pub fn to_batches(&self) -> Vec<AcknowledgementBatch> {
        let mut batches: Vec<AcknowledgementBatch> = Vec::new();
        for (offset, acknowledge_type) in &self.acknowledgements {
            let type_id = acknowledge_type.map_or(ACKNOWLEDGE_TYPE_GAP, AcknowledgeType::id);
            match batches.last_mut() {
                Some(batch) if batch.last_offset + 1 == *offset => {
                    batch.last_offset = *offset;
                    batch.acknowledge_types.push(type_id);
                }
                _ => batches.push(AcknowledgementBatch {
                    first_offset: *offset,
                    last_offset: *offset,
                    acknowledge_types: vec![type_id],
                }),
            }
        }
        for batch in &mut batches {
            if batch.acknowledge_types.windows(2).all(|w| w[0] == w[1]) {
                batch.acknowledge_types.truncate(1);
            }
        }
        batches
    }
}

/// Acknowledgements for a partition, tagged with the node they were fetched from
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAcknowledgements {
    pub node_id: i32,
    pub acknowledgements: Acknowledgements,
}

impl NodeAcknowledgements {
    pub fn new(node_id: i32, acknowledgements: Acknowledgements) -> Self {
        Self {
            node_id,
            acknowledgements,
        }
    }
}
