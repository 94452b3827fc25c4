//! Share consumer tests against a scripted broker
//!
//! Records are acquired through the real network thread and acknowledged
//! explicitly, so every acknowledgement path ends in a ShareAcknowledge the
//! broker can inspect.

mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use streamline_client::consumer::events::AcknowledgementResults;
use streamline_client::consumer::protocol::RequestBody;
use streamline_client::consumer::share::{AcknowledgeType, FINAL_EPOCH};
use streamline_client::consumer::{AcknowledgementCommitCallback, ShareConsumer, ShareRecord};
use streamline_client::error::ConsumerError;
use streamline_client::testing::MockClient;
use streamline_client::util::SystemClock;
use uuid::Uuid;

struct Harness {
    consumer: ShareConsumer,
    client: MockClient,
    broker: ScriptedBroker,
}

fn start() -> Harness {
    let topic_id = Uuid::new_v4();
    let client = MockClient::new(vec![node(1), node(2)]);
    let broker = ScriptedBroker::new(topic_id, &[0]);
    broker.install(&client);

    let mut consumer = ShareConsumer::new(
        explicit_share_config(),
        Box::new(client.clone()),
        Box::new(shared_cluster(topic_id)),
        Arc::new(SystemClock::new()),
    )
    .unwrap();
    consumer
        .subscribe([TOPIC.to_string()].into())
        .unwrap();
    Harness {
        consumer,
        client,
        broker,
    }
}

fn acknowledge_requests(broker: &ScriptedBroker) -> Vec<(i32, usize)> {
    broker
        .acknowledgements
        .lock()
        .iter()
        .filter_map(|body| match body {
            RequestBody::ShareAcknowledge(request) => {
                Some((request.share_session_epoch, request.acknowledgements.len()))
            }
            _ => None,
        })
        .collect()
}

#[derive(Default, Clone)]
struct RecordingCallback {
    results: Arc<Mutex<Vec<AcknowledgementResults>>>,
}

impl AcknowledgementCommitCallback for RecordingCallback {
    fn on_complete(&mut self, results: &AcknowledgementResults) {
        self.results.lock().push(results.clone());
    }
}

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn test_poll_returns_acquired_records() {
    let mut harness = start();
    let records = harness.consumer.poll(Duration::from_secs(5)).unwrap();

    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
    assert!(records.iter().all(|r| r.delivery_count == 1));
    assert!(records.iter().all(|r| r.partition.topic() == TOPIC && r.partition.partition() == 0));
    assert_eq!(records[1].value.as_deref(), Some(&b"value-1"[..]));

    // the fetch went to the partition leader, not the coordinator connection
    let fetches = harness.client.sent_of("ShareFetch");
    assert!(!fetches.is_empty());
    assert_eq!(fetches[0].node.id, 1);

    harness.consumer.close(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_explicit_mode_requires_acknowledgement_before_next_poll() {
    let mut harness = start();
    let records = harness.consumer.poll(Duration::from_secs(5)).unwrap();
    assert_eq!(records.len(), 3);

    assert!(matches!(
        harness.consumer.poll(Duration::from_millis(10)),
        Err(ConsumerError::IllegalState(_))
    ));

    // acknowledging a record twice is rejected
    harness.consumer.acknowledge(&records[0], AcknowledgeType::Accept).unwrap();
    assert!(harness.consumer.acknowledge(&records[0], AcknowledgeType::Accept).is_err());

    let stranger = ShareRecord {
        offset: 99,
        ..records[0].clone()
    };
    assert!(harness.consumer.acknowledge(&stranger, AcknowledgeType::Accept).is_err());

    harness.consumer.close(Duration::from_secs(5)).unwrap();
}

// =============================================================================
// Commit
// =============================================================================

#[test]
fn test_commit_sync_reports_each_offset() {
    let mut harness = start();
    let records = harness.consumer.poll(Duration::from_secs(5)).unwrap();
    assert_eq!(records.len(), 3);

    harness.consumer.acknowledge(&records[0], AcknowledgeType::Accept).unwrap();
    harness.consumer.acknowledge(&records[1], AcknowledgeType::Accept).unwrap();
    harness.consumer.acknowledge(&records[2], AcknowledgeType::Reject).unwrap();

    let results = harness.consumer.commit_sync(Duration::from_secs(5)).unwrap();
    assert_eq!(results.len(), 1);
    let acknowledged = &results[&records[0].partition];
    assert!(acknowledged.error().is_none());
    let offsets: Vec<_> = acknowledged.offsets().collect();
    assert_eq!(
        offsets,
        vec![
            (0, Some(AcknowledgeType::Accept)),
            (1, Some(AcknowledgeType::Accept)),
            (2, Some(AcknowledgeType::Reject)),
        ]
    );

    let sent = acknowledge_requests(&harness.broker);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0 > 0);

    // nothing left to send
    let empty = harness.consumer.commit_sync(Duration::from_secs(1)).unwrap();
    assert!(empty.is_empty());
    assert_eq!(acknowledge_requests(&harness.broker).len(), 1);

    harness.consumer.close(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_commit_async_reports_through_callback() {
    let mut harness = start();
    let callback = RecordingCallback::default();
    harness
        .consumer
        .set_acknowledgement_commit_callback(Some(Box::new(callback.clone())))
        .unwrap();

    let records = harness.consumer.poll(Duration::from_secs(5)).unwrap();
    for record in &records {
        harness.consumer.acknowledge(record, AcknowledgeType::Release).unwrap();
    }
    harness.consumer.commit_async().unwrap();

    let consumer = &mut harness.consumer;
    let results = Arc::clone(&callback.results);
    assert!(eventually(
        Duration::from_secs(5),
        || {
            let _ = consumer.poll(Duration::from_millis(20));
        },
        || !results.lock().is_empty(),
    ));

    let reported = callback.results.lock()[0].clone();
    let acknowledged = &reported[&records[0].partition];
    assert_eq!(acknowledged.len(), 3);
    assert!(acknowledged.error().is_none());

    harness.consumer.close(Duration::from_secs(5)).unwrap();
}

// =============================================================================
// Close
// =============================================================================

#[test]
fn test_close_flushes_acknowledgements_and_ends_session() {
    let mut harness = start();
    let records = harness.consumer.poll(Duration::from_secs(5)).unwrap();
    for record in &records {
        harness.consumer.acknowledge(record, AcknowledgeType::Accept).unwrap();
    }

    harness.consumer.close(Duration::from_secs(5)).unwrap();
    harness.consumer.close(Duration::from_secs(5)).unwrap();

    let sent = acknowledge_requests(&harness.broker);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], (FINAL_EPOCH, 1));

    let leave = harness
        .client
        .sent_of("ShareGroupHeartbeat")
        .into_iter()
        .filter(|sent| matches!(&sent.body, RequestBody::ShareGroupHeartbeat(r) if r.member_epoch == -1))
        .count();
    assert_eq!(leave, 1);
    assert_eq!(harness.client.close_count(), 1);
    assert!(matches!(
        harness.consumer.commit_async(),
        Err(ConsumerError::Closed)
    ));
}
