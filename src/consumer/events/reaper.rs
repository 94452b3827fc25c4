//! Expires completable events whose deadline has passed

use crate::consumer::future::Completable;
use crate::error::ConsumerError;
use std::sync::Arc;
use tracing::debug;

struct TrackedEvent {
    name: &'static str,
    deadline_ms: u64,
    result: Arc<dyn Completable>,
}

/// Tracks completable events handed to the background thread and fails the
/// ones that outlive their deadline
#[derive(Default)]
pub struct CompletableEventReaper {
    tracked: Vec<TrackedEvent>,
}

impl CompletableEventReaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &'static str, deadline_ms: u64, result: Arc<dyn Completable>) {
        self.tracked.push(TrackedEvent {
            name,
            deadline_ms,
            result,
        });
    }

    /// Drop completed events and time out expired ones; returns how many were expired
    pub fn reap(&mut self, now_ms: u64) -> usize {
        let mut expired = 0;
        self.tracked.retain(|event| {
            if event.result.is_completed() {
                return false;
            }
            if now_ms >= event.deadline_ms {
                let err = ConsumerError::Timeout(format!(
                    "{} could not be completed before its deadline of {}ms",
                    event.name, event.deadline_ms
                ));
                if event.result.fail(err) {
                    expired += 1;
                    debug!(event = event.name, deadline_ms = event.deadline_ms, "Expired event");
                }
                return false;
            }
            true
        });
        expired
    }

    /// Time out everything still pending; used when the background thread shuts down
    pub fn reap_all(&mut self) -> usize {
        let mut expired = 0;
        for event in self.tracked.drain(..) {
            if event.result.is_completed() {
                continue;
            }
            let err = ConsumerError::Timeout(format!(
                "{} was still pending when the consumer closed",
                event.name
            ));
            if event.result.fail(err) {
                expired += 1;
            }
        }
        expired
    }

    pub fn size(&self) -> usize {
        self.tracked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::future::CompletableResult;

    #[test]
    fn test_reap_expires_only_past_deadline() {
        let mut reaper = CompletableEventReaper::new();
        let early: CompletableResult<()> = CompletableResult::new();
        let late: CompletableResult<()> = CompletableResult::new();
        reaper.add("early", 100, Arc::new(early.clone()));
        reaper.add("late", 500, Arc::new(late.clone()));

        assert_eq!(reaper.reap(99), 0);
        assert_eq!(reaper.reap(100), 1);
        assert!(matches!(early.try_get(), Some(Err(ConsumerError::Timeout(_)))));
        assert!(!late.is_done());
        assert_eq!(reaper.size(), 1);
    }

    #[test]
    fn test_completed_events_are_dropped_without_error() {
        let mut reaper = CompletableEventReaper::new();
        let done: CompletableResult<u8> = CompletableResult::new();
        reaper.add("done", 10, Arc::new(done.clone()));
        done.complete(7);
        assert_eq!(reaper.reap(1_000), 0);
        assert_eq!(done.try_get(), Some(Ok(7)));
        assert_eq!(reaper.size(), 0);
    }

    #[test]
    fn test_reap_all_on_close() {
        let mut reaper = CompletableEventReaper::new();
        let pending: CompletableResult<()> = CompletableResult::new();
        reaper.add("pending", u64::MAX, Arc::new(pending.clone()));
        assert_eq!(reaper.reap_all(), 1);
        assert!(pending.is_done());
    }
}
