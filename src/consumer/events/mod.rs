//! Events exchanged between the application thread and the background thread
//!
//! Application events carry user commands to the network thread; background
//! events carry errors, rebalance callback requests and fetch results back.
//! Both directions are unbounded mpsc channels (see [`queue`]).

pub mod handler;
pub mod queue;
pub mod reaper;

use super::future::{Completable, CompletableResult};
use super::membership::StreamsTask;
use super::share::{Acknowledgements, NodeAcknowledgements, ShareCompletedFetch};
use super::topic_partition::{TopicIdPartition, TopicPartition};
use crate::error::{ConsumerError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub use handler::{ApplicationEventHandler, BackgroundEventHandler};
pub use queue::{event_queue, EventReceiver, EventSender};
pub use reaper::CompletableEventReaper;

/// Acknowledgements keyed by partition, each bound to the node that delivered the records
pub type AcknowledgementsMap = BTreeMap<TopicIdPartition, NodeAcknowledgements>;

/// Per-partition results handed back to the application
pub type AcknowledgementResults = BTreeMap<TopicIdPartition, Acknowledgements>;

/// Commands sent from the application thread to the background thread
pub enum ApplicationEvent {
    /// The application entered `poll`; resets the poll timer
    Poll { poll_time_ms: u64 },
    Subscribe {
        topics: BTreeSet<String>,
        has_listener: bool,
        deadline_ms: u64,
        result: CompletableResult<()>,
    },
    Unsubscribe {
        deadline_ms: u64,
        result: CompletableResult<()>,
    },
    LeaveGroupOnClose {
        deadline_ms: u64,
        result: CompletableResult<()>,
    },
    /// A rebalance callback finished running on the application thread
    RebalanceCallbackCompleted { id: u64, result: Result<()> },
    /// Fetch more records, piggy-backing any pending acknowledgements
    ShareFetch { acknowledgements: AcknowledgementsMap },
    ShareAcknowledgeAsync { acknowledgements: AcknowledgementsMap },
    ShareAcknowledgeSync {
        acknowledgements: AcknowledgementsMap,
        deadline_ms: u64,
        result: CompletableResult<AcknowledgementResults>,
    },
    ShareAcknowledgeOnClose {
        acknowledgements: AcknowledgementsMap,
        deadline_ms: u64,
        result: CompletableResult<()>,
    },
    ShareAcknowledgementCommitCallbackRegistration { enabled: bool },
}

impl ApplicationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ApplicationEvent::Poll { .. } => "Poll",
            ApplicationEvent::Subscribe { .. } => "Subscribe",
            ApplicationEvent::Unsubscribe { .. } => "Unsubscribe",
            ApplicationEvent::LeaveGroupOnClose { .. } => "LeaveGroupOnClose",
            ApplicationEvent::RebalanceCallbackCompleted { .. } => "RebalanceCallbackCompleted",
            ApplicationEvent::ShareFetch { .. } => "ShareFetch",
            ApplicationEvent::ShareAcknowledgeAsync { .. } => "ShareAcknowledgeAsync",
            ApplicationEvent::ShareAcknowledgeSync { .. } => "ShareAcknowledgeSync",
            ApplicationEvent::ShareAcknowledgeOnClose { .. } => "ShareAcknowledgeOnClose",
            ApplicationEvent::ShareAcknowledgementCommitCallbackRegistration { .. } => {
                "ShareAcknowledgementCommitCallbackRegistration"
            }
        }
    }

    /// Deadline and type-erased result of completable events, for the reaper
    pub fn completable(&self) -> Option<(u64, Arc<dyn Completable>)> {
        match self {
            ApplicationEvent::Subscribe {
                deadline_ms, result, ..
            }
            | ApplicationEvent::Unsubscribe { deadline_ms, result }
            | ApplicationEvent::LeaveGroupOnClose { deadline_ms, result }
            | ApplicationEvent::ShareAcknowledgeOnClose {
                deadline_ms, result, ..
            } => Some((*deadline_ms, Arc::new(result.clone()))),
            ApplicationEvent::ShareAcknowledgeSync {
                deadline_ms, result, ..
            } => Some((*deadline_ms, Arc::new(result.clone()))),
            _ => None,
        }
    }
}

impl fmt::Debug for ApplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationEvent")
            .field("type", &self.name())
            .finish()
    }
}

/// Which rebalance callback the application must run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackMethod {
    Revoked,
    Assigned,
    Lost,
}

impl CallbackMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackMethod::Revoked => "revoked",
            CallbackMethod::Assigned => "assigned",
            CallbackMethod::Lost => "lost",
        }
    }
}

/// Units handed to a rebalance callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackPayload {
    Partitions(BTreeSet<TopicPartition>),
    Tasks(BTreeSet<StreamsTask>),
}

impl CallbackPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            CallbackPayload::Partitions(partitions) => partitions.is_empty(),
            CallbackPayload::Tasks(tasks) => tasks.is_empty(),
        }
    }
}

/// Notifications sent from the background thread to the application thread
#[derive(Debug, Clone)]
pub enum BackgroundEvent {
    Error(ConsumerError),
    /// Run a rebalance callback and answer with `RebalanceCallbackCompleted`
    RebalanceCallbackNeeded {
        id: u64,
        method: CallbackMethod,
        payload: CallbackPayload,
    },
    ShareFetchCompleted(ShareCompletedFetch),
    ShareAcknowledgementCommitCallback {
        acknowledgements: AcknowledgementResults,
    },
}

impl BackgroundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundEvent::Error(_) => "Error",
            BackgroundEvent::RebalanceCallbackNeeded { .. } => "RebalanceCallbackNeeded",
            BackgroundEvent::ShareFetchCompleted(_) => "ShareFetchCompleted",
            BackgroundEvent::ShareAcknowledgementCommitCallback { .. } => {
                "ShareAcknowledgementCommitCallback"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completable_events_expose_deadline() {
        let result = CompletableResult::new();
        let event = ApplicationEvent::Unsubscribe {
            deadline_ms: 500,
            result: result.clone(),
        };
        let (deadline, erased) = event.completable().unwrap();
        assert_eq!(deadline, 500);
        erased.fail(ConsumerError::Closed);
        assert_eq!(result.try_get(), Some(Err(ConsumerError::Closed)));

        let poll = ApplicationEvent::Poll { poll_time_ms: 1 };
        assert!(poll.completable().is_none());
        assert_eq!(poll.name(), "Poll");
    }

    #[test]
    fn test_payload_emptiness() {
        assert!(CallbackPayload::Partitions(BTreeSet::new()).is_empty());
        assert!(!CallbackPayload::Partitions(BTreeSet::from([TopicPartition::new("t", 0)])).is_empty());
    }
}
