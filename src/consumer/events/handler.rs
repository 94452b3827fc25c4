//! Event handlers on either side of the thread boundary
//!
//! [`BackgroundEventHandler`] is used by request managers on the network
//! thread to report back to the application. [`ApplicationEventHandler`] is
//! used by the application thread to submit commands and wait for them.

use super::queue::EventSender;
use super::{ApplicationEvent, BackgroundEvent};
use crate::consumer::future::CompletableResult;
use crate::consumer::request::NetworkWaker;
use crate::error::{ConsumerError, Result};
use crate::metrics;
use crate::util::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

pub const BACKGROUND_QUEUE: &str = "background";
pub const APPLICATION_QUEUE: &str = "application";

const INITIAL_WAIT_SLICE_MS: u64 = 1;
const MAX_WAIT_SLICE_MS: u64 = 100;

/// Pushes background events to the application thread
#[derive(Clone)]
pub struct BackgroundEventHandler {
    queue: EventSender<BackgroundEvent>,
    closed: Arc<AtomicBool>,
}

impl BackgroundEventHandler {
    pub fn new(queue: EventSender<BackgroundEvent>) -> Self {
        Self {
            queue,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add(&self, event: BackgroundEvent) {
        let name = event.name();
        if let Err(err) = self.queue.add(event) {
            warn!(event = name, error = %err, "Application side is gone, background event not delivered");
        } else {
            trace!(event = name, "Enqueued background event");
        }
    }

    pub fn add_error(&self, error: ConsumerError) {
        self.add(BackgroundEvent::Error(error));
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Stop reporting queue size; queued events stay available for a final drain
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            metrics::update_queue_size(BACKGROUND_QUEUE, 0);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Submits application events and wakes the network thread
#[derive(Clone)]
pub struct ApplicationEventHandler {
    queue: EventSender<ApplicationEvent>,
    waker: Arc<dyn NetworkWaker>,
}

impl ApplicationEventHandler {
    pub fn new(queue: EventSender<ApplicationEvent>, waker: Arc<dyn NetworkWaker>) -> Self {
        Self { queue, waker }
    }

    /// Enqueue an event and interrupt the network thread's transport poll
    pub fn add(&self, event: ApplicationEvent) -> Result<()> {
        trace!(event = event.name(), "Enqueued application event");
        self.queue.add(event)?;
        self.waker.wakeup();
        Ok(())
    }

    /// Enqueue `event` and wait until `result` completes or `deadline_ms` passes.
    ///
    /// The wait happens in growing slices; `between_waits` runs after each
    /// slice and its error (typically a queued background error) ends the
    /// wait early.
    pub fn add_and_get<T, F>(
        &self,
        event: ApplicationEvent,
        result: &CompletableResult<T>,
        deadline_ms: u64,
        clock: &dyn Clock,
        mut between_waits: F,
    ) -> Result<T>
    where
        T: Clone,
        F: FnMut() -> Result<()>,
    {
        let operation = event.name();
        self.add(event)?;

        let start_ms = clock.now_ms();
        let mut slice_ms = INITIAL_WAIT_SLICE_MS;
        loop {
            if let Some(outcome) = result.wait_for(Duration::from_millis(slice_ms)) {
                return outcome;
            }
            between_waits()?;
            if let Some(outcome) = result.try_get() {
                return outcome;
            }
            let now_ms = clock.now_ms();
            if now_ms >= deadline_ms {
                return Err(ConsumerError::timeout(
                    operation,
                    deadline_ms.saturating_sub(start_ms),
                ));
            }
            slice_ms = (slice_ms * 2)
                .min(MAX_WAIT_SLICE_MS)
                .min(deadline_ms - now_ms);
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }
}
