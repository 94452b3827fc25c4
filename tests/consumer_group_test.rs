//! Consumer group tests against a scripted broker
//!
//! Each test runs the real network thread with a [`MockClient`] answering as
//! coordinator, so joins, reconciliation and leaving all go through the
//! event queues.

mod common;

use common::*;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use streamline_client::consumer::protocol::RequestBody;
use streamline_client::consumer::{AsyncConsumer, ConsumerRebalanceListener, TopicPartition};
use streamline_client::error::{ConsumerError, Result};
use streamline_client::testing::MockClient;
use streamline_client::util::SystemClock;
use uuid::Uuid;

type CallLog = Arc<Mutex<Vec<(&'static str, BTreeSet<TopicPartition>)>>>;

struct RecordingListener {
    calls: CallLog,
}

impl ConsumerRebalanceListener for RecordingListener {
    fn on_partitions_revoked(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.calls.lock().push(("revoked", partitions.clone()));
        Ok(())
    }

    fn on_partitions_assigned(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.calls.lock().push(("assigned", partitions.clone()));
        Ok(())
    }
}

fn orders(partitions: &[i32]) -> BTreeSet<TopicPartition> {
    partitions.iter().map(|p| TopicPartition::new(TOPIC, *p)).collect()
}

struct Harness {
    consumer: AsyncConsumer,
    client: MockClient,
    broker: ScriptedBroker,
    calls: CallLog,
}

fn start(partitions: &[i32]) -> Harness {
    let topic_id = Uuid::new_v4();
    let client = MockClient::new(vec![node(1), node(2)]);
    let broker = ScriptedBroker::new(topic_id, partitions);
    broker.install(&client);

    let consumer = AsyncConsumer::new(
        config(),
        Box::new(client.clone()),
        Box::new(shared_cluster(topic_id)),
        Arc::new(SystemClock::new()),
    )
    .unwrap();
    Harness {
        consumer,
        client,
        broker,
        calls: Arc::default(),
    }
}

impl Harness {
    fn subscribe(&mut self) {
        let listener = RecordingListener {
            calls: Arc::clone(&self.calls),
        };
        self.consumer
            .subscribe(BTreeSet::from([TOPIC.to_string()]), Some(Box::new(listener)))
            .unwrap();
    }

    fn poll_until(&mut self, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            self.consumer.poll(Duration::from_millis(20)).unwrap();
            if condition(self) {
                return true;
            }
        }
        false
    }

    fn assigned_callback_ran(&self, partitions: &BTreeSet<TopicPartition>) -> bool {
        self.calls
            .lock()
            .iter()
            .any(|(method, called)| *method == "assigned" && called == partitions)
    }
}

// =============================================================================
// Join and Reconcile
// =============================================================================

#[test]
fn test_join_assigns_partitions_and_runs_listener() {
    let mut harness = start(&[0, 1]);
    harness.subscribe();

    assert!(harness.poll_until(|h| h.assigned_callback_ran(&orders(&[0, 1]))));
    assert_eq!(harness.consumer.assignment(), orders(&[0, 1]));

    let member = harness.consumer.member();
    assert_eq!(member.member_id, "member-1");
    assert_eq!(member.member_epoch, Some(1));

    // coordinator traffic uses the rewritten connection id
    let heartbeats = harness.client.sent_of("ConsumerGroupHeartbeat");
    assert!(!heartbeats.is_empty());
    assert!(heartbeats.iter().all(|sent| sent.node.id == i32::MAX - 1));
    match &heartbeats[0].body {
        RequestBody::ConsumerGroupHeartbeat(request) => {
            assert_eq!(request.member_epoch, 0);
            assert_eq!(request.subscribed_topic_names, Some(vec![TOPIC.to_string()]));
        }
        other => panic!("unexpected request {:?}", other),
    }
    harness.consumer.close(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_reassignment_revokes_before_assigning() {
    let mut harness = start(&[0, 1]);
    harness.subscribe();
    assert!(harness.poll_until(|h| h.assigned_callback_ran(&orders(&[0, 1]))));

    harness.broker.reassign(&[1, 2]);
    assert!(harness.poll_until(|h| h.assigned_callback_ran(&orders(&[2]))));
    assert_eq!(harness.consumer.assignment(), orders(&[1, 2]));
    assert_eq!(harness.consumer.member().member_epoch, Some(2));

    let calls = harness.calls.lock().clone();
    let revoked = calls
        .iter()
        .position(|(method, partitions)| *method == "revoked" && *partitions == orders(&[0]))
        .expect("revoke callback for orders-0");
    let assigned = calls
        .iter()
        .position(|(method, partitions)| *method == "assigned" && *partitions == orders(&[2]))
        .expect("assign callback for orders-2");
    assert!(revoked < assigned);
    harness.consumer.close(Duration::from_secs(5)).unwrap();
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_blank_topic_is_rejected() {
    let mut harness = start(&[0]);
    let outcome = harness
        .consumer
        .subscribe(BTreeSet::from(["  ".to_string()]), None);
    assert!(matches!(outcome, Err(ConsumerError::IllegalState(_))));
    assert!(harness.client.sent_of("ConsumerGroupHeartbeat").is_empty());
}

#[test]
fn test_wakeup_interrupts_poll() {
    let mut harness = start(&[0]);
    harness.consumer.wakeup();
    assert!(matches!(
        harness.consumer.poll(Duration::from_secs(10)),
        Err(ConsumerError::Wakeup)
    ));
    // the wakeup is consumed by the call it interrupted
    harness.consumer.poll(Duration::from_millis(10)).unwrap();
}

// =============================================================================
// Close
// =============================================================================

#[test]
fn test_close_leaves_group_once() {
    let mut harness = start(&[0, 1]);
    harness.subscribe();
    assert!(harness.poll_until(|h| h.assigned_callback_ran(&orders(&[0, 1]))));

    harness.consumer.close(Duration::from_secs(5)).unwrap();
    harness.consumer.close(Duration::from_secs(5)).unwrap();
    harness.consumer.close(Duration::from_secs(5)).unwrap();

    assert!(harness.consumer.is_closed());
    assert_eq!(harness.client.close_count(), 1);
    assert!(harness
        .calls
        .lock()
        .iter()
        .any(|(method, partitions)| *method == "revoked" && *partitions == orders(&[0, 1])));

    let leave = harness
        .client
        .sent_of("ConsumerGroupHeartbeat")
        .into_iter()
        .filter_map(|sent| match sent.body {
            RequestBody::ConsumerGroupHeartbeat(request) => Some(request.member_epoch),
            _ => None,
        })
        .filter(|epoch| *epoch == -1)
        .count();
    assert_eq!(leave, 1);

    assert!(matches!(
        harness.consumer.poll(Duration::from_millis(10)),
        Err(ConsumerError::Closed)
    ));
}
