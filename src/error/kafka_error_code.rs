//! Kafka protocol error codes understood by the group coordination engine

/// Kafka protocol error codes
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum KafkaErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Leader not available
    LeaderNotAvailable = 5,
    /// Not leader or follower for partition
    NotLeaderOrFollower = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Network exception
    NetworkException = 13,
    /// Coordinator load in progress
    CoordinatorLoadInProgress = 14,
    /// Coordinator not available
    CoordinatorNotAvailable = 15,
    /// Not coordinator for group
    NotCoordinator = 16,
    /// Invalid group id
    InvalidGroupId = 24,
    /// Unknown member
    UnknownMemberId = 25,
    /// Topic authorization failed
    TopicAuthorizationFailed = 29,
    /// Group authorization failed
    GroupAuthorizationFailed = 30,
    /// Cluster authorization failed
    ClusterAuthorizationFailed = 31,
    /// Unsupported version
    UnsupportedVersion = 35,
    /// Invalid request
    InvalidRequest = 42,
    /// Fenced leader epoch
    FencedLeaderEpoch = 74,
    /// Unknown leader epoch
    UnknownLeaderEpoch = 75,
    /// Group max size reached
    GroupMaxSizeReached = 81,
    /// Fenced instance id
    FencedInstanceId = 82,
    /// Unknown topic id
    UnknownTopicId = 100,
    /// Member epoch is fenced by the coordinator
    FencedMemberEpoch = 110,
    /// Static instance id still in use by another member
    UnreleasedInstanceId = 111,
    /// Server-side assignor not supported
    UnsupportedAssignor = 112,
    /// Member epoch is stale
    StaleMemberEpoch = 113,
    /// Record is not in a state that permits acknowledgement
    InvalidRecordState = 121,
    /// Share session not found
    ShareSessionNotFound = 122,
    /// Invalid share session epoch
    InvalidShareSessionEpoch = 123,
    /// Streams topology is invalid
    StreamsInvalidTopology = 130,
    /// Streams topology epoch is invalid
    StreamsInvalidTopologyEpoch = 131,
    /// Streams topology is fenced
    StreamsTopologyFenced = 132,
}

impl KafkaErrorCode {
    /// Map a wire error code to a known variant.
    ///
    /// Codes this engine does not model collapse to `UnknownServerError`.
    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => KafkaErrorCode::None,
            3 => KafkaErrorCode::UnknownTopicOrPartition,
            5 => KafkaErrorCode::LeaderNotAvailable,
            6 => KafkaErrorCode::NotLeaderOrFollower,
            7 => KafkaErrorCode::RequestTimedOut,
            13 => KafkaErrorCode::NetworkException,
            14 => KafkaErrorCode::CoordinatorLoadInProgress,
            15 => KafkaErrorCode::CoordinatorNotAvailable,
            16 => KafkaErrorCode::NotCoordinator,
            24 => KafkaErrorCode::InvalidGroupId,
            25 => KafkaErrorCode::UnknownMemberId,
            29 => KafkaErrorCode::TopicAuthorizationFailed,
            30 => KafkaErrorCode::GroupAuthorizationFailed,
            31 => KafkaErrorCode::ClusterAuthorizationFailed,
            35 => KafkaErrorCode::UnsupportedVersion,
            42 => KafkaErrorCode::InvalidRequest,
            74 => KafkaErrorCode::FencedLeaderEpoch,
            75 => KafkaErrorCode::UnknownLeaderEpoch,
            81 => KafkaErrorCode::GroupMaxSizeReached,
            82 => KafkaErrorCode::FencedInstanceId,
            100 => KafkaErrorCode::UnknownTopicId,
            110 => KafkaErrorCode::FencedMemberEpoch,
            111 => KafkaErrorCode::UnreleasedInstanceId,
            112 => KafkaErrorCode::UnsupportedAssignor,
            113 => KafkaErrorCode::StaleMemberEpoch,
            121 => KafkaErrorCode::InvalidRecordState,
            122 => KafkaErrorCode::ShareSessionNotFound,
            123 => KafkaErrorCode::InvalidShareSessionEpoch,
            130 => KafkaErrorCode::StreamsInvalidTopology,
            131 => KafkaErrorCode::StreamsInvalidTopologyEpoch,
            132 => KafkaErrorCode::StreamsTopologyFenced,
            _ => KafkaErrorCode::UnknownServerError,
        }
    }

    /// Returns true if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaErrorCode::UnknownTopicOrPartition
                | KafkaErrorCode::LeaderNotAvailable
                | KafkaErrorCode::NotLeaderOrFollower
                | KafkaErrorCode::RequestTimedOut
                | KafkaErrorCode::NetworkException
                | KafkaErrorCode::CoordinatorLoadInProgress
                | KafkaErrorCode::CoordinatorNotAvailable
                | KafkaErrorCode::NotCoordinator
                | KafkaErrorCode::FencedLeaderEpoch
                | KafkaErrorCode::UnknownLeaderEpoch
                | KafkaErrorCode::UnknownTopicId
                | KafkaErrorCode::ShareSessionNotFound
                | KafkaErrorCode::InvalidShareSessionEpoch
        )
    }

    /// True for codes that mean the member must drop its assignment and rejoin
    pub fn is_fencing(&self) -> bool {
        matches!(
            self,
            KafkaErrorCode::FencedMemberEpoch | KafkaErrorCode::UnknownMemberId
        )
    }

    /// True for codes that mean the partition leader is no longer the node we talked to
    pub fn is_leadership_error(&self) -> bool {
        matches!(
            self,
            KafkaErrorCode::NotLeaderOrFollower
                | KafkaErrorCode::FencedLeaderEpoch
                | KafkaErrorCode::UnknownTopicOrPartition
        )
    }

    /// Convert to the i16 error code used in Kafka protocol
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}
