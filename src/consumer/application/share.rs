//! Share group facade

use super::{complete_callback, GroupClient, MemberSnapshot, WakeupTrigger};
use crate::config::{AcknowledgementMode, ConsumerConfig};
use crate::consumer::events::{
    AcknowledgementResults, AcknowledgementsMap, ApplicationEvent, ApplicationEventHandler, BackgroundEvent,
};
use crate::consumer::future::CompletableResult;
use crate::consumer::membership::ShareFlavor;
use crate::consumer::metadata::MetadataView;
use crate::consumer::request::KafkaClient;
use crate::consumer::share::{AcknowledgeType, Acknowledgements, NodeAcknowledgements, ShareCompletedFetch};
use crate::consumer::topic_partition::TopicIdPartition;
use crate::error::{ConsumerError, Result};
use crate::util::Clock;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A record acquired by this member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRecord {
    pub partition: TopicIdPartition,
    pub offset: i64,
    pub delivery_count: i16,
    pub timestamp_ms: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// Receives the outcome of acknowledgements once the broker has answered
pub trait AcknowledgementCommitCallback: Send {
    fn on_complete(&mut self, results: &AcknowledgementResults);
}

// ========== Delivery Tracking ==========

#[derive(Debug)]
struct DeliveredPartition {
    node_id: i32,
    pending: Acknowledgements,
    unacknowledged: BTreeSet<i64>,
}

/// Records handed to the application and the acknowledgements not yet sent
#[derive(Debug, Default)]
struct DeliveryTracker {
    buffered: VecDeque<ShareRecord>,
    /// Node each buffered record's partition was fetched from
    buffered_nodes: BTreeMap<TopicIdPartition, i32>,
    delivered: BTreeMap<TopicIdPartition, DeliveredPartition>,
}

impl DeliveryTracker {
    /// Buffer the acquired records of a fetch; acquired offsets without a
    /// record are acknowledged as gaps
    fn add_fetch(&mut self, fetch: ShareCompletedFetch) {
        let ShareCompletedFetch {
            node_id,
            partition,
            data,
        } = fetch;
        let records: BTreeMap<i64, _> = data.records.into_iter().map(|r| (r.offset, r)).collect();
        let mut gaps = Vec::new();
        for acquired in &data.acquired_records {
            for offset in acquired.first_offset..=acquired.last_offset {
                match records.get(&offset) {
                    Some(record) => self.buffered.push_back(ShareRecord {
                        partition: partition.clone(),
                        offset,
                        delivery_count: acquired.delivery_count,
                        timestamp_ms: record.timestamp_ms,
                        key: record.key.clone(),
                        value: record.value.clone(),
                    }),
                    None => gaps.push(offset),
                }
            }
        }
        self.buffered_nodes.insert(partition.clone(), node_id);
        if !gaps.is_empty() {
            let entry = self.entry(partition, node_id);
            for offset in gaps {
                entry.pending.add_gap(offset);
            }
        }
    }

    fn entry(&mut self, partition: TopicIdPartition, node_id: i32) -> &mut DeliveredPartition {
        self.delivered
            .entry(partition)
            .or_insert_with(|| DeliveredPartition {
                node_id,
                pending: Acknowledgements::empty(),
                unacknowledged: BTreeSet::new(),
            })
    }

    fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }

    /// Hand out up to `max` buffered records
    fn deliver(&mut self, max: usize) -> Vec<ShareRecord> {
        let count = self.buffered.len().min(max.max(1));
        let records: Vec<ShareRecord> = self.buffered.drain(..count).collect();
        for record in &records {
            let node_id = self.buffered_nodes.get(&record.partition).copied().unwrap_or(-1);
            self.entry(record.partition.clone(), node_id)
                .unacknowledged
                .insert(record.offset);
        }
        records
    }

    fn acknowledge(&mut self, record: &ShareRecord, acknowledge_type: AcknowledgeType) -> Result<()> {
        let delivered = self
            .delivered
            .get_mut(&record.partition)
            .filter(|d| d.unacknowledged.contains(&record.offset))
            .ok_or_else(|| {
                ConsumerError::illegal_state(
                    "acknowledge",
                    format!("record {}@{} is not awaiting acknowledgement", record.partition, record.offset),
                )
            })?;
        delivered.unacknowledged.remove(&record.offset);
        delivered.pending.add(record.offset, acknowledge_type);
        Ok(())
    }

    fn accept_all(&mut self) {
        for delivered in self.delivered.values_mut() {
            for offset in std::mem::take(&mut delivered.unacknowledged) {
                delivered.pending.add(offset, AcknowledgeType::Accept);
            }
        }
    }

    fn has_unacknowledged(&self) -> bool {
        self.delivered.values().any(|d| !d.unacknowledged.is_empty())
    }

    /// Remove and return every acknowledgement recorded so far
    fn take_pending(&mut self) -> AcknowledgementsMap {
        let mut map = AcknowledgementsMap::new();
        for (partition, delivered) in self.delivered.iter_mut() {
            if delivered.pending.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut delivered.pending);
            map.insert(partition.clone(), NodeAcknowledgements::new(delivered.node_id, pending));
        }
        self.delivered.retain(|_, d| !d.unacknowledged.is_empty());
        map
    }
}

// ========== Share Consumer ==========

type CommitCallback = Option<Box<dyn AcknowledgementCommitCallback>>;

/// Member of a share group: records are acquired per delivery and
/// acknowledged individually
pub struct ShareConsumer {
    client: GroupClient,
    mode: AcknowledgementMode,
    max_poll_records: usize,
    tracker: DeliveryTracker,
    commit_callback: CommitCallback,
}

impl ShareConsumer {
    pub fn new(
        config: ConsumerConfig,
        client: Box<dyn KafkaClient>,
        metadata: Box<dyn MetadataView + Send>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mode = config.share_acknowledgement_mode;
        let max_poll_records = config.max_poll_records as usize;
        let client = GroupClient::start(config, ShareFlavor::new(), true, client, metadata, clock)?;
        Ok(Self {
            client,
            mode,
            max_poll_records,
            tracker: DeliveryTracker::default(),
            commit_callback: None,
        })
    }

    pub fn subscribe(&mut self, topics: BTreeSet<String>) -> Result<()> {
        self.client.ensure_open()?;
        if topics.is_empty() {
            return self.unsubscribe();
        }
        let deadline_ms = self.client.default_deadline_ms();
        let result = CompletableResult::new();
        let event = ApplicationEvent::Subscribe {
            topics,
            has_listener: false,
            deadline_ms,
            result: result.clone(),
        };
        let (tracker, callback) = (&mut self.tracker, &mut self.commit_callback);
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(tracker, callback, events, event)
            })
    }

    pub fn unsubscribe(&mut self) -> Result<()> {
        self.client.ensure_open()?;
        let deadline_ms = self.client.default_deadline_ms();
        let result = CompletableResult::new();
        let event = ApplicationEvent::Unsubscribe {
            deadline_ms,
            result: result.clone(),
        };
        let (tracker, callback) = (&mut self.tracker, &mut self.commit_callback);
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(tracker, callback, events, event)
            })
    }

    /// Acknowledge the previous delivery and wait up to `timeout` for records
    ///
    /// In implicit mode every record returned by the previous call is
    /// accepted. In explicit mode they must all have been acknowledged.
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<ShareRecord>> {
        self.client.ensure_open()?;
        self.client.wakeup_trigger().maybe_trigger_wakeup()?;
        match self.mode {
            AcknowledgementMode::Implicit => self.tracker.accept_all(),
            AcknowledgementMode::Explicit if self.tracker.has_unacknowledged() => {
                return Err(ConsumerError::illegal_state(
                    "poll",
                    "all records from the previous poll must be acknowledged in explicit mode",
                ));
            }
            AcknowledgementMode::Explicit => {}
        }

        let deadline_ms = self.client.deadline_ms(timeout);
        self.client.add(ApplicationEvent::Poll {
            poll_time_ms: self.client.now_ms(),
        })?;
        self.client.add(ApplicationEvent::ShareFetch {
            acknowledgements: self.tracker.take_pending(),
        })?;

        loop {
            self.process_background_events()?;
            if self.tracker.has_buffered() {
                // a wakeup arriving now is left for the next call
                let records = self.tracker.deliver(self.max_poll_records);
                trace!(records = records.len(), "Returning share records");
                return Ok(records);
            }
            let now_ms = self.client.now_ms();
            if now_ms >= deadline_ms {
                return Ok(Vec::new());
            }
            self.client.wait(deadline_ms - now_ms)?;
        }
    }

    /// Record how one delivered record was handled (explicit mode only)
    pub fn acknowledge(&mut self, record: &ShareRecord, acknowledge_type: AcknowledgeType) -> Result<()> {
        self.client.ensure_open()?;
        if self.mode == AcknowledgementMode::Implicit {
            return Err(ConsumerError::illegal_state(
                "acknowledge",
                "records are acknowledged implicitly in this consumer",
            ));
        }
        self.tracker.acknowledge(record, acknowledge_type)
    }

    /// Send every recorded acknowledgement and wait for the outcome
    pub fn commit_sync(&mut self, timeout: Duration) -> Result<AcknowledgementResults> {
        self.client.ensure_open()?;
        if self.mode == AcknowledgementMode::Implicit {
            self.tracker.accept_all();
        }
        let deadline_ms = self.client.deadline_ms(timeout);
        let result = CompletableResult::new();
        let event = ApplicationEvent::ShareAcknowledgeSync {
            acknowledgements: self.tracker.take_pending(),
            deadline_ms,
            result: result.clone(),
        };
        let (tracker, callback) = (&mut self.tracker, &mut self.commit_callback);
        self.client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(tracker, callback, events, event)
            })
    }

    /// Send every recorded acknowledgement without waiting
    pub fn commit_async(&mut self) -> Result<()> {
        self.client.ensure_open()?;
        if self.mode == AcknowledgementMode::Implicit {
            self.tracker.accept_all();
        }
        let acknowledgements = self.tracker.take_pending();
        if acknowledgements.is_empty() {
            return Ok(());
        }
        self.client.add(ApplicationEvent::ShareAcknowledgeAsync { acknowledgements })
    }

    /// Install or remove the callback told about acknowledgement outcomes
    pub fn set_acknowledgement_commit_callback(
        &mut self,
        callback: Option<Box<dyn AcknowledgementCommitCallback>>,
    ) -> Result<()> {
        self.client.ensure_open()?;
        let enabled = callback.is_some();
        self.commit_callback = callback;
        self.client
            .add(ApplicationEvent::ShareAcknowledgementCommitCallbackRegistration { enabled })
    }

    fn process_background_events(&mut self) -> Result<()> {
        let (tracker, callback) = (&mut self.tracker, &mut self.commit_callback);
        self.client
            .process_background_events(&mut |events, event| handle_event(tracker, callback, events, event))
    }

    pub fn member(&self) -> MemberSnapshot {
        self.client.member()
    }

    pub fn wakeup_trigger(&self) -> WakeupTrigger {
        self.client.wakeup_trigger()
    }

    pub fn wakeup(&self) {
        self.client.wakeup_trigger().wakeup();
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Flush acknowledgements, close share sessions, leave the group and stop
    /// the network thread. Later calls do nothing.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        if self.client.is_closed() {
            return Ok(());
        }
        let deadline_ms = self.client.deadline_ms(timeout);
        if self.mode == AcknowledgementMode::Implicit {
            self.tracker.accept_all();
        }
        let result = CompletableResult::new();
        let event = ApplicationEvent::ShareAcknowledgeOnClose {
            acknowledgements: self.tracker.take_pending(),
            deadline_ms,
            result: result.clone(),
        };
        let (tracker, callback) = (&mut self.tracker, &mut self.commit_callback);
        let flushed = self
            .client
            .add_and_get(event, &result, deadline_ms, &mut |events, event| {
                handle_event(tracker, callback, events, event)
            });
        if let Err(error) = &flushed {
            warn!(error = %error, "Failed to flush acknowledgements on close");
        }

        let remaining = Duration::from_millis(deadline_ms.saturating_sub(self.client.now_ms()));
        let (tracker, callback) = (&mut self.tracker, &mut self.commit_callback);
        let left = self.client.close(remaining, &mut |events, event| {
            handle_event(tracker, callback, events, event)
        });
        flushed.and(left)
    }
}

impl Drop for ShareConsumer {
    fn drop(&mut self) {
        if !self.client.is_closed() {
            let timeout = Duration::from_millis(self.client.config().default_api_timeout_ms);
            if let Err(error) = self.close(timeout) {
                warn!(error = %error, "Share consumer close on drop failed");
            }
        }
    }
}

fn handle_event(
    tracker: &mut DeliveryTracker,
    callback: &mut CommitCallback,
    events: &ApplicationEventHandler,
    event: BackgroundEvent,
) -> Result<()> {
    match event {
        BackgroundEvent::ShareFetchCompleted(fetch) => {
            if fetch.data.error_code != 0 {
                debug!(partition = %fetch.partition, error_code = fetch.data.error_code, "Share fetch returned a partition error");
            }
            tracker.add_fetch(fetch);
            Ok(())
        }
        BackgroundEvent::ShareAcknowledgementCommitCallback { acknowledgements } => {
            if let Some(callback) = callback.as_mut() {
                callback.on_complete(&acknowledgements);
            }
            Ok(())
        }
        BackgroundEvent::RebalanceCallbackNeeded { id, .. } => complete_callback(events, id, Ok(())),
        other => {
            debug!(event = other.name(), "Ignoring background event not meant for a share group member");
            Ok(())
        }
    }
}
