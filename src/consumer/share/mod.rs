//! Share group consumption: fetch sessions and record acknowledgement
//!
//! Records delivered by a share fetch are acquired by this member until they
//! are acknowledged (accept, release or reject) or their acquisition lock
//! times out on the broker. Acknowledgements are sent either piggy-backed on
//! the next fetch to the same node or in standalone ShareAcknowledge requests
//! created by the commit and close APIs.

mod ack_state;
mod acknowledgements;
mod manager;
mod result_handler;
mod session;

pub use ack_state::{AckMap, AcknowledgeRequestState, AcknowledgeRequestType};
pub use acknowledgements::{AcknowledgeType, Acknowledgements, NodeAcknowledgements, ACKNOWLEDGE_TYPE_GAP};
pub use manager::ShareConsumeRequestManager;
pub use result_handler::{CommitCallbackSink, ResultHandler};
pub use session::{ShareSessionHandler, FINAL_EPOCH, INITIAL_EPOCH};

use super::protocol::ShareFetchPartitionData;
use super::topic_partition::TopicIdPartition;

/// Records and acquisition info for one partition, handed to the application
#[derive(Debug, Clone)]
pub struct ShareCompletedFetch {
    /// Node that delivered the records; acknowledgements must go back to it
    pub node_id: i32,
    pub partition: TopicIdPartition,
    pub data: ShareFetchPartitionData,
}
