//! Group coordination for consumer, share and streams group members
//!
//! The application thread talks to the facades in [`application`]. They turn
//! calls into [`events::ApplicationEvent`]s processed on the background
//! thread ([`background`]), where the request managers live:
//!
//! - [`request::CoordinatorRequestManager`] finds the group coordinator
//! - [`heartbeat::HeartbeatRequestManager`] keeps the membership alive
//! - [`membership::MembershipManager`] reconciles assignments
//! - [`share::ShareConsumeRequestManager`] fetches and acknowledges share records
//!
//! Results flow back as [`events::BackgroundEvent`]s.

pub mod application;
pub mod background;
pub mod events;
pub mod future;
pub mod heartbeat;
pub mod membership;
pub mod metadata;
pub mod protocol;
pub mod request;
pub mod share;
pub mod subscription;
pub mod topic_partition;

pub use application::{
    AcknowledgementCommitCallback, AsyncConsumer, ConsumerRebalanceListener, MemberSnapshot, ShareConsumer,
    ShareRecord, StreamsGroupMember, StreamsRebalanceListener, WakeupTrigger,
};
pub use future::CompletableResult;
pub use membership::{MemberState, MembershipManager};
pub use metadata::{ClusterMetadata, MetadataView};
pub use subscription::SubscriptionState;
pub use topic_partition::{TopicIdPartition, TopicIdPartitionSet, TopicPartition};
