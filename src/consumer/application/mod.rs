//! Application-thread facades
//!
//! [`AsyncConsumer`], [`ShareConsumer`] and [`StreamsGroupMember`] are the
//! user-facing entry points. Each one starts a background network thread,
//! turns user calls into application events and runs rebalance and
//! acknowledgement callbacks on the calling thread while it drains
//! background events.
//!
//! The facades are not `Sync`: one thread drives a client. Another thread
//! may interrupt a blocking call through a [`WakeupTrigger`] handle.

mod consumer;
mod share;
mod streams;
mod wakeup;

pub use consumer::{AsyncConsumer, ConsumerRebalanceListener};
pub use share::{AcknowledgementCommitCallback, ShareConsumer, ShareRecord};
pub use streams::{StreamsGroupMember, StreamsRebalanceListener};
pub use wakeup::WakeupTrigger;

use super::background::{ApplicationEventProcessor, ConsumerNetworkThread, NetworkThreadHandle, RequestManagers};
use super::events::handler::{APPLICATION_QUEUE, BACKGROUND_QUEUE};
use super::events::{
    event_queue, ApplicationEvent, ApplicationEventHandler, BackgroundEvent, BackgroundEventHandler, EventReceiver,
};
use super::future::CompletableResult;
use super::membership::{MemberStateListener, MembershipFlavor, MembershipManager};
use super::metadata::MetadataView;
use super::request::{KafkaClient, NetworkClientDelegate};
use super::topic_partition::TopicPartition;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, Result};
use crate::util::Clock;
use parking_lot::RwLock;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest single sleep while a poll waits for background events
const POLL_WAIT_SLICE_MS: u64 = 10;

// ========== Member Snapshot ==========

/// Member identity and assignment as last reported by the background thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub member_id: String,
    /// `None` while the member is out of the group
    pub member_epoch: Option<i32>,
    pub assignment: BTreeSet<TopicPartition>,
}

#[derive(Default)]
pub(crate) struct MemberInfo {
    snapshot: RwLock<MemberSnapshot>,
}

impl MemberInfo {
    pub(crate) fn snapshot(&self) -> MemberSnapshot {
        self.snapshot.read().clone()
    }
}

impl MemberStateListener for MemberInfo {
    fn on_member_epoch_updated(&self, epoch: Option<i32>, member_id: &str) {
        let mut snapshot = self.snapshot.write();
        snapshot.member_epoch = epoch;
        snapshot.member_id = member_id.to_string();
    }

    fn on_group_assignment_updated(&self, partitions: &BTreeSet<TopicPartition>) {
        self.snapshot.write().assignment = partitions.clone();
    }
}

// ========== Group Client ==========

/// `now_ms + timeout`, saturating for timeouts beyond the millisecond range
fn deadline_after(now_ms: u64, timeout: Duration) -> u64 {
    now_ms.saturating_add(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
}

/// Plumbing shared by every facade: queues, network thread and wakeup
pub(crate) struct GroupClient {
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    application_events: ApplicationEventHandler,
    background_events: EventReceiver<BackgroundEvent>,
    /// Drained but not yet handled; an error stops handling and leaves the rest here
    pending_events: VecDeque<BackgroundEvent>,
    network_thread: NetworkThreadHandle,
    member: Arc<MemberInfo>,
    wakeup: WakeupTrigger,
    closed: bool,
}

impl GroupClient {
    pub(crate) fn start<F>(
        config: ConsumerConfig,
        flavor: F,
        with_share: bool,
        client: Box<dyn KafkaClient>,
        metadata: Box<dyn MetadataView + Send>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        F: MembershipFlavor + Send + 'static,
        F::Assignment: Send,
    {
        config.validate()?;
        let (background_tx, background_events) = event_queue(BACKGROUND_QUEUE);
        let background = BackgroundEventHandler::new(background_tx);
        let (application_tx, application_rx) = event_queue(APPLICATION_QUEUE);

        let member = Arc::new(MemberInfo::default());
        let mut membership = MembershipManager::new(flavor, &config, background.clone());
        membership.register_state_listener(member.clone());

        let managers = RequestManagers::new(&config, membership, background.clone(), with_share, clock.now_ms());
        let processor = ApplicationEventProcessor::new(managers, metadata);
        let network = NetworkClientDelegate::new(client, config.request_timeout_ms, config.retry_backoff_ms);
        let network_thread = ConsumerNetworkThread::new(
            &config,
            processor,
            network,
            application_rx,
            background,
            Arc::clone(&clock),
        )
        .start()?;
        let application_events = ApplicationEventHandler::new(application_tx, network_thread.waker());

        info!(
            group_id = %config.group_id,
            client_id = %config.client_id,
            group_type = F::GROUP_TYPE,
            "Started group client"
        );
        Ok(Self {
            config,
            clock,
            application_events,
            background_events,
            pending_events: VecDeque::new(),
            network_thread,
            member,
            wakeup: WakeupTrigger::new(),
            closed: false,
        })
    }

    pub(crate) fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn deadline_ms(&self, timeout: Duration) -> u64 {
        deadline_after(self.now_ms(), timeout)
    }

    pub(crate) fn default_deadline_ms(&self) -> u64 {
        self.now_ms().saturating_add(self.config.default_api_timeout_ms)
    }

    pub(crate) fn member(&self) -> MemberSnapshot {
        self.member.snapshot()
    }

    pub(crate) fn wakeup_trigger(&self) -> WakeupTrigger {
        self.wakeup.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ConsumerError::Closed);
        }
        Ok(())
    }

    pub(crate) fn add(&self, event: ApplicationEvent) -> Result<()> {
        self.application_events.add(event)
    }

    /// Handle queued background events in order. Errors are returned one at a
    /// time; events behind an error stay queued for the next call.
    pub(crate) fn process_background_events<H>(&mut self, handler: &mut H) -> Result<()>
    where
        H: FnMut(&ApplicationEventHandler, BackgroundEvent) -> Result<()>,
    {
        self.pending_events.extend(self.background_events.drain_events());
        while let Some(event) = self.pending_events.pop_front() {
            match event {
                BackgroundEvent::Error(error) => return Err(error),
                event => handler(&self.application_events, event)?,
            }
        }
        Ok(())
    }

    /// Submit `event` and wait for `result`, handling background events
    /// between wait slices. A wakeup fails the wait.
    pub(crate) fn add_and_get<T, H>(
        &mut self,
        event: ApplicationEvent,
        result: &CompletableResult<T>,
        deadline_ms: u64,
        handler: &mut H,
    ) -> Result<T>
    where
        T: Clone + Send + 'static,
        H: FnMut(&ApplicationEventHandler, BackgroundEvent) -> Result<()>,
    {
        self.wakeup.set_active_task(result)?;
        let outcome = self.wait_for_result(event, result, deadline_ms, handler);
        self.wakeup.clear_task();
        outcome
    }

    fn wait_for_result<T, H>(
        &mut self,
        event: ApplicationEvent,
        result: &CompletableResult<T>,
        deadline_ms: u64,
        handler: &mut H,
    ) -> Result<T>
    where
        T: Clone,
        H: FnMut(&ApplicationEventHandler, BackgroundEvent) -> Result<()>,
    {
        let events = self.application_events.clone();
        let clock = Arc::clone(&self.clock);
        events.add_and_get(event, result, deadline_ms, clock.as_ref(), || {
            self.process_background_events(&mut *handler)
        })
    }

    /// Sleep up to `max_ms`, returning early on wakeup
    pub(crate) fn wait(&self, max_ms: u64) -> Result<()> {
        let sleeper: CompletableResult<()> = CompletableResult::new();
        self.wakeup.set_active_task(&sleeper)?;
        let outcome = sleeper.wait_for(Duration::from_millis(max_ms.min(POLL_WAIT_SLICE_MS)));
        self.wakeup.clear_task();
        match outcome {
            Some(Err(error)) => Err(error),
            _ => Ok(()),
        }
    }

    /// Leave the group, stop the network thread and fail whatever is still
    /// pending. Returns the leave outcome; later calls return `Ok` and do nothing.
    pub(crate) fn close<H>(&mut self, timeout: Duration, handler: &mut H) -> Result<()>
    where
        H: FnMut(&ApplicationEventHandler, BackgroundEvent) -> Result<()>,
    {
        if self.closed {
            debug!(group_id = %self.config.group_id, "Group client already closed");
            return Ok(());
        }
        self.closed = true;
        let deadline_ms = self.deadline_ms(timeout);

        let leave = CompletableResult::new();
        let outcome = self.wait_for_result(
            ApplicationEvent::LeaveGroupOnClose {
                deadline_ms,
                result: leave.clone(),
            },
            &leave,
            deadline_ms,
            handler,
        );
        if let Err(error) = &outcome {
            warn!(group_id = %self.config.group_id, error = %error, "Failed to leave the group cleanly on close");
        }

        let remaining_ms = deadline_ms.saturating_sub(self.now_ms());
        self.network_thread.close(remaining_ms);
        self.pending_events.extend(self.background_events.drain_events());
        let remaining = std::mem::take(&mut self.pending_events);
        let outcome = settle_events_after_close(remaining, outcome, &self.application_events, handler);
        info!(group_id = %self.config.group_id, "Closed group client");
        outcome
    }
}

/// Account for every background event left once the network thread stopped.
///
/// The first queued error becomes the close outcome unless close already
/// failed. Commit callbacks still run; rebalance callbacks and fetched
/// records can no longer be used and are logged.
fn settle_events_after_close<H>(
    remaining: VecDeque<BackgroundEvent>,
    mut outcome: Result<()>,
    events: &ApplicationEventHandler,
    handler: &mut H,
) -> Result<()>
where
    H: FnMut(&ApplicationEventHandler, BackgroundEvent) -> Result<()>,
{
    for event in remaining {
        match event {
            BackgroundEvent::Error(error) => {
                if outcome.is_ok() {
                    outcome = Err(error);
                } else {
                    warn!(error = %error, "Error raised while closing, reporting the earlier close failure");
                }
            }
            BackgroundEvent::RebalanceCallbackNeeded { id, method, payload } => {
                warn!(
                    id,
                    method = method.as_str(),
                    payload = ?payload,
                    "Rebalance callback requested after the network thread stopped, not running it"
                );
            }
            BackgroundEvent::ShareFetchCompleted(fetch) => {
                warn!(
                    partition = %fetch.partition,
                    node_id = fetch.node_id,
                    records = fetch.data.records.len(),
                    "Discarding records fetched during close, the broker releases them with the session"
                );
            }
            event @ BackgroundEvent::ShareAcknowledgementCommitCallback { .. } => {
                if let Err(error) = handler(events, event) {
                    warn!(error = %error, "Acknowledgement commit callback failed during close");
                }
            }
        }
    }
    outcome
}

impl Drop for GroupClient {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.network_thread.close(0);
        }
    }
}

/// Answer a rebalance callback request with the callback's outcome
pub(crate) fn complete_callback(events: &ApplicationEventHandler, id: u64, result: Result<()>) -> Result<()> {
    events.add(ApplicationEvent::RebalanceCallbackCompleted {
        id,
        result: result.clone(),
    })?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::events::{AcknowledgementResults, CallbackMethod, CallbackPayload};
    use crate::consumer::request::NetworkWaker;
    use crate::error::KafkaErrorCode;

    struct NoopWaker;

    impl NetworkWaker for NoopWaker {
        fn wakeup(&self) {}
    }

    fn events() -> ApplicationEventHandler {
        let (tx, _rx) = event_queue(APPLICATION_QUEUE);
        ApplicationEventHandler::new(tx, Arc::new(NoopWaker))
    }

    fn fatal() -> ConsumerError {
        ConsumerError::from_code(KafkaErrorCode::GroupAuthorizationFailed, None)
    }

    #[test]
    fn test_queued_error_becomes_close_outcome() {
        let remaining = VecDeque::from([
            BackgroundEvent::RebalanceCallbackNeeded {
                id: 7,
                method: CallbackMethod::Revoked,
                payload: CallbackPayload::Partitions(BTreeSet::new()),
            },
            BackgroundEvent::Error(fatal()),
            BackgroundEvent::Error(ConsumerError::illegal_state("second", "later")),
        ]);
        let mut handled = Vec::new();
        let outcome = settle_events_after_close(remaining, Ok(()), &events(), &mut |_, event| {
            handled.push(event.name());
            Ok(())
        });

        let error = outcome.unwrap_err();
        assert_eq!(error.kafka_error_code(), KafkaErrorCode::GroupAuthorizationFailed);
        // rebalance callbacks cannot be answered any more
        assert!(handled.is_empty());
    }

    #[test]
    fn test_earlier_close_failure_wins() {
        let remaining = VecDeque::from([BackgroundEvent::Error(fatal())]);
        let outcome = settle_events_after_close(
            remaining,
            Err(ConsumerError::Timeout("leave".into())),
            &events(),
            &mut |_, _| Ok(()),
        );
        assert!(matches!(outcome, Err(ConsumerError::Timeout(_))));
    }

    #[test]
    fn test_commit_callbacks_still_run_after_close() {
        let remaining = VecDeque::from([BackgroundEvent::ShareAcknowledgementCommitCallback {
            acknowledgements: AcknowledgementResults::new(),
        }]);
        let mut handled = Vec::new();
        let outcome = settle_events_after_close(remaining, Ok(()), &events(), &mut |_, event| {
            handled.push(event.name());
            Ok(())
        });
        assert!(outcome.is_ok());
        assert_eq!(handled, vec!["ShareAcknowledgementCommitCallback"]);
    }

    #[test]
    fn test_deadline_saturates_for_huge_timeouts() {
        assert_eq!(deadline_after(1_000, Duration::from_millis(250)), 1_250);
        assert_eq!(deadline_after(1_000, Duration::MAX), u64::MAX);
        assert_eq!(deadline_after(u64::MAX - 1, Duration::from_secs(1)), u64::MAX);
    }
}
