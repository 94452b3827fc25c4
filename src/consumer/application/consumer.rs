//! Consumer group facade

use super::{complete_callback, GroupClient, MemberSnapshot, WakeupTrigger};
use crate::config::ConsumerConfig;
use crate::consumer::events::{ApplicationEvent, ApplicationEventHandler, BackgroundEvent, CallbackMethod, CallbackPayload};
use crate::consumer::future::CompletableResult;
use crate::consumer::membership::ConsumerFlavor;
use crate::consumer::metadata::MetadataView;
use crate::consumer::request::KafkaClient;
use crate::consumer::topic_partition::TopicPartition;
use crate::error::{ConsumerError, Result};
use crate::util::Clock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// User hooks run on the polling thread during a rebalance
///
/// An error returned from a hook stops that reconciliation step; the
/// assignment is retried on a later heartbeat.
pub trait ConsumerRebalanceListener: Send {
    fn on_partitions_revoked(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()>;

    fn on_partitions_assigned(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()>;

    /// Partitions taken away without a chance to commit. Defaults to revoke.
    fn on_partitions_lost(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.on_partitions_revoked(partitions)
    }
}

type Listener = Option<Box<dyn ConsumerRebalanceListener>>;

/// Member of a consumer group whose protocol work runs on a background thread
///
/// # Example
///
/// ```no_run
/// use streamline_client::config::ConsumerConfig;
/// use streamline_client::consumer::AsyncConsumer;
/// use streamline_client::consumer::metadata::ClusterMetadata;
/// use streamline_client::consumer::protocol::Node;
/// use streamline_client::testing::MockClient;
/// use streamline_client::util::SystemClock;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let config = ConsumerConfig::builder().group_id("orders-app").build();
/// let client = MockClient::new(vec![Node::new(1, "localhost", 9092)]);
/// let mut consumer = AsyncConsumer::new(
///     config,
///     Box::new(client),
///     Box::new(ClusterMetadata::new()),
///     Arc::new(SystemClock::new()),
/// )?;
/// consumer.subscribe(["orders".to_string()].into(), None)?;
/// consumer.poll(Duration::from_millis(100))?;
/// consumer.close(Duration::from_secs(5))?;
/// # Ok::<(), streamline_client::error::ConsumerError>(())
/// ```
pub struct AsyncConsumer {
    client: GroupClient,
    listener: Listener,
}

impl AsyncConsumer {
    pub fn new(
        config: ConsumerConfig,
        client: Box<dyn KafkaClient>,
        metadata: Box<dyn MetadataView + Send>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = GroupClient::start(config, ConsumerFlavor::new(), false, client, metadata, clock)?;
        Ok(Self { client, listener: None })
    }

    /// Replace the topic subscription. The group is joined on the next `poll`.
    pub fn subscribe(
        &mut self,
        topics: BTreeSet<String>,
        listener: Option<Box<dyn ConsumerRebalanceListener>>,
    ) -> Result<()> {
        self.client.ensure_open()?;
        if topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConsumerError::illegal_state("subscribe", "topic names must not be blank"));
        }
        if topics.is_empty() {
            return self.unsubscribe();
        }
        let has_listener = listener.is_some();
        self.listener = listener;

        let deadline_ms = self.client.default_deadline_ms();
        let result = CompletableResult::new();
        let event = ApplicationEvent::Subscribe {
            topics,
            has_listener,
            deadline_ms,
            result: result.clone(),
        };
        let listener = &mut self.listener;
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(listener, events, event)
            })
    }

    /// Leave the group, running the revoke callback for owned partitions
    pub fn unsubscribe(&mut self) -> Result<()> {
        self.client.ensure_open()?;
        let deadline_ms = self.client.default_deadline_ms();
        let result = CompletableResult::new();
        let event = ApplicationEvent::Unsubscribe {
            deadline_ms,
            result: result.clone(),
        };
        let listener = &mut self.listener;
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(listener, events, event)
            })
    }

    /// Reset the poll timer and run any rebalance callbacks for up to `timeout`
    pub fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.client.ensure_open()?;
        self.client.wakeup_trigger().maybe_trigger_wakeup()?;

        let deadline_ms = self.client.deadline_ms(timeout);
        self.client.add(ApplicationEvent::Poll {
            poll_time_ms: self.client.now_ms(),
        })?;
        loop {
            self.process_background_events()?;
            let now_ms = self.client.now_ms();
            if now_ms >= deadline_ms {
                return Ok(());
            }
            self.client.wait(deadline_ms - now_ms)?;
        }
    }

    fn process_background_events(&mut self) -> Result<()> {
        let listener = &mut self.listener;
        self.client
            .process_background_events(&mut |events, event| handle_event(listener, events, event))
    }

    /// Partitions currently owned by this member
    pub fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.client.member().assignment
    }

    pub fn member(&self) -> MemberSnapshot {
        self.client.member()
    }

    /// Handle for interrupting a blocking call from another thread
    pub fn wakeup_trigger(&self) -> WakeupTrigger {
        self.client.wakeup_trigger()
    }

    pub fn wakeup(&self) {
        self.client.wakeup_trigger().wakeup();
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Leave the group and stop the network thread. Safe to call repeatedly.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        let listener = &mut self.listener;
        self.client
            .close(timeout, &mut |events, event| handle_event(listener, events, event))
    }
}

impl Drop for AsyncConsumer {
    fn drop(&mut self) {
        if !self.client.is_closed() {
            let timeout = Duration::from_millis(self.client.config().default_api_timeout_ms);
            if let Err(error) = self.close(timeout) {
                warn!(error = %error, "Consumer close on drop failed");
            }
        }
    }
}

fn handle_event(listener: &mut Listener, events: &ApplicationEventHandler, event: BackgroundEvent) -> Result<()> {
    match event {
        BackgroundEvent::RebalanceCallbackNeeded { id, method, payload } => {
            let CallbackPayload::Partitions(partitions) = payload else {
                return complete_callback(
                    events,
                    id,
                    Err(ConsumerError::illegal_state("rebalance callback", "expected partitions")),
                );
            };
            debug!(id, method = method.as_str(), partitions = partitions.len(), "Running rebalance callback");
            let result = match listener.as_mut() {
                Some(listener) => match method {
                    CallbackMethod::Revoked => listener.on_partitions_revoked(&partitions),
                    CallbackMethod::Assigned => listener.on_partitions_assigned(&partitions),
                    CallbackMethod::Lost => listener.on_partitions_lost(&partitions),
                },
                None => Ok(()),
            }
            .map_err(|e| ConsumerError::Callback(format!("on_partitions_{}: {}", method.as_str(), e)));
            complete_callback(events, id, result)
        }
        other => {
            debug!(event = other.name(), "Ignoring background event not meant for a consumer group member");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::events::event_queue;
    use crate::consumer::request::NetworkWaker;
    use parking_lot::Mutex;

    struct NoopWaker;

    impl NetworkWaker for NoopWaker {
        fn wakeup(&self) {}
    }

    #[derive(Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<(&'static str, usize)>>>,
        fail_assign: bool,
    }

    impl ConsumerRebalanceListener for Recording {
        fn on_partitions_revoked(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
            self.calls.lock().push(("revoked", partitions.len()));
            Ok(())
        }

        fn on_partitions_assigned(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
            self.calls.lock().push(("assigned", partitions.len()));
            if self.fail_assign {
                return Err(ConsumerError::illegal_state("assign", "boom"));
            }
            Ok(())
        }
    }

    fn partitions() -> BTreeSet<TopicPartition> {
        BTreeSet::from([TopicPartition::new("orders", 0), TopicPartition::new("orders", 1)])
    }

    #[test]
    fn test_callback_runs_listener_and_reports_completion() {
        let (tx, mut rx) = event_queue("application");
        let events = ApplicationEventHandler::new(tx, Arc::new(NoopWaker));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut listener: Listener = Some(Box::new(Recording {
            calls: Arc::clone(&calls),
            fail_assign: false,
        }));

        let event = BackgroundEvent::RebalanceCallbackNeeded {
            id: 7,
            method: CallbackMethod::Lost,
            payload: CallbackPayload::Partitions(partitions()),
        };
        handle_event(&mut listener, &events, event).unwrap();

        // lost falls back to revoked
        assert_eq!(*calls.lock(), vec![("revoked", 2)]);
        let sent = rx.drain_events();
        assert!(matches!(
            sent.as_slice(),
            [ApplicationEvent::RebalanceCallbackCompleted { id: 7, result: Ok(()) }]
        ));
    }

    #[test]
    fn test_failed_callback_is_reported_and_returned() {
        let (tx, mut rx) = event_queue("application");
        let events = ApplicationEventHandler::new(tx, Arc::new(NoopWaker));
        let mut listener: Listener = Some(Box::new(Recording {
            calls: Arc::default(),
            fail_assign: true,
        }));

        let event = BackgroundEvent::RebalanceCallbackNeeded {
            id: 1,
            method: CallbackMethod::Assigned,
            payload: CallbackPayload::Partitions(partitions()),
        };
        let outcome = handle_event(&mut listener, &events, event);
        assert!(matches!(outcome, Err(ConsumerError::Callback(_))));
        assert!(matches!(
            rx.drain_events().as_slice(),
            [ApplicationEvent::RebalanceCallbackCompleted {
                id: 1,
                result: Err(ConsumerError::Callback(_))
            }]
        ));
    }

    #[test]
    fn test_callback_without_listener_completes() {
        let (tx, mut rx) = event_queue("application");
        let events = ApplicationEventHandler::new(tx, Arc::new(NoopWaker));
        let mut listener: Listener = None;
        let event = BackgroundEvent::RebalanceCallbackNeeded {
            id: 3,
            method: CallbackMethod::Revoked,
            payload: CallbackPayload::Partitions(partitions()),
        };
        handle_event(&mut listener, &events, event).unwrap();
        assert_eq!(rx.drain_events().len(), 1);
    }
}
