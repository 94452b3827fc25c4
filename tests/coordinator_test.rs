//! Coordinator discovery tests
//!
//! Covers FindCoordinator backoff, connection id rewriting and the
//! once-a-minute warning while the member has no coordinator.

mod common;

use common::*;
use streamline_client::consumer::protocol::{FindCoordinatorResponse, RequestBody, ResponseBody};
use streamline_client::consumer::request::CoordinatorRequestManager;
use streamline_client::error::KafkaErrorCode;

const DISCONNECT_WARNING: &str = "Consumer has been disconnected from the group coordinator for";

fn discovered_manager() -> CoordinatorRequestManager {
    let mut manager = CoordinatorRequestManager::new(&config());
    assert_eq!(manager.poll(0).unsent_requests.len(), 1);
    manager.handle_response(
        Ok(ResponseBody::FindCoordinator(FindCoordinatorResponse::found(GROUP_ID, node(1)))),
        0,
    );
    manager
}

// =============================================================================
// Discovery
// =============================================================================

#[test]
fn test_discovery_uses_dedicated_connection_id() {
    let mut manager = discovered_manager();
    let coordinator = manager.coordinator().cloned().unwrap();
    assert_eq!(coordinator.id, i32::MAX - 1);
    assert_eq!(coordinator.host, "localhost");
    assert!(manager.poll(10).unsent_requests.is_empty());
}

#[test]
fn test_request_targets_group_key() {
    let mut manager = CoordinatorRequestManager::new(&config());
    let result = manager.poll(0);
    match &result.unsent_requests[0].body {
        RequestBody::FindCoordinator(request) => assert_eq!(request.key, GROUP_ID),
        other => panic!("unexpected request {:?}", other),
    }
}

#[test]
fn test_failed_lookup_waits_for_backoff() {
    let mut manager = CoordinatorRequestManager::new(&config());
    assert_eq!(manager.poll(0).unsent_requests.len(), 1);
    manager.handle_response(
        Ok(ResponseBody::FindCoordinator(FindCoordinatorResponse::error(
            GROUP_ID,
            KafkaErrorCode::CoordinatorNotAvailable.as_i16(),
        ))),
        0,
    );
    assert!(manager.coordinator().is_none());
    assert!(manager.fatal_error().is_none());

    let waiting = manager.poll(99);
    assert!(waiting.unsent_requests.is_empty());
    assert_eq!(waiting.time_until_next_poll_ms, 1);

    assert_eq!(manager.poll(100).unsent_requests.len(), 1);
}

// =============================================================================
// Disconnect Tracking
// =============================================================================

#[test]
fn test_disconnect_warning_logged_once_per_minute() {
    let logs = LogCapture::default();
    let mut manager = discovered_manager();

    logs.run(tracing::Level::WARN, || {
        manager.mark_coordinator_unknown("connection lost", 0);
        manager.mark_coordinator_unknown("still down", 30_000);
    });
    assert_eq!(logs.count(DISCONNECT_WARNING), 0);

    logs.run(tracing::Level::WARN, || {
        manager.mark_coordinator_unknown("still down", 60_000);
    });
    assert_eq!(logs.count(DISCONNECT_WARNING), 1);
    assert!(logs.contents().contains("for 60000ms"));

    logs.run(tracing::Level::WARN, || {
        manager.mark_coordinator_unknown("still down", 90_000);
    });
    assert_eq!(logs.count(DISCONNECT_WARNING), 1);

    logs.run(tracing::Level::WARN, || {
        manager.mark_coordinator_unknown("still down", 120_000);
    });
    assert_eq!(logs.count(DISCONNECT_WARNING), 2);
    assert!(logs.contents().contains("for 120000ms"));
}

#[test]
fn test_rediscovery_resets_disconnect_tracking() {
    let logs = LogCapture::default();
    let mut manager = discovered_manager();

    logs.run(tracing::Level::INFO, || {
        manager.mark_coordinator_unknown("connection lost", 1_000);
        manager.mark_coordinator_unknown("still down", 61_000);
    });
    assert_eq!(logs.count(DISCONNECT_WARNING), 1);
    assert!(logs.contents().contains("will attempt rediscovery"));

    assert_eq!(manager.poll(61_000).unsent_requests.len(), 1);
    manager.handle_response(
        Ok(ResponseBody::FindCoordinator(FindCoordinatorResponse::found(GROUP_ID, node(2)))),
        61_000,
    );
    assert_eq!(manager.coordinator().map(|n| n.id), Some(i32::MAX - 2));

    // a fresh outage starts counting from zero
    logs.clear();
    logs.run(tracing::Level::WARN, || {
        manager.mark_coordinator_unknown("connection lost", 100_000);
        manager.mark_coordinator_unknown("still down", 150_000);
    });
    assert_eq!(logs.count(DISCONNECT_WARNING), 0);
}
