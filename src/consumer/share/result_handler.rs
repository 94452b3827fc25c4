//! Gathers per-partition acknowledgement outcomes for one commit call
//!
//! A synchronous commit or close fans out into one request state per node.
//! All of them share one [`ResultHandler`]; the caller's future completes
//! once, when the last state has finished. Asynchronous commits have no
//! future and report each partition as soon as it completes.

use super::acknowledgements::Acknowledgements;
use crate::consumer::events::{AcknowledgementResults, BackgroundEvent, BackgroundEventHandler};
use crate::consumer::future::CompletableResult;
use crate::consumer::topic_partition::TopicIdPartition;
use crate::metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Emits commit callback events when the application registered a callback
pub struct CommitCallbackSink<'a> {
    background: &'a BackgroundEventHandler,
    enabled: bool,
}

impl<'a> CommitCallbackSink<'a> {
    pub fn new(background: &'a BackgroundEventHandler, enabled: bool) -> Self {
        Self { background, enabled }
    }

    fn emit(&self, acknowledgements: AcknowledgementResults) {
        if self.enabled && !acknowledgements.is_empty() {
            self.background
                .add(BackgroundEvent::ShareAcknowledgementCommitCallback { acknowledgements });
        }
    }
}

#[derive(Debug)]
enum Completion {
    Async,
    Sync(CompletableResult<AcknowledgementResults>),
    Close(CompletableResult<()>),
}

#[derive(Debug)]
struct Inner {
    completion: Completion,
    remaining: usize,
    results: AcknowledgementResults,
    done: bool,
}

#[derive(Debug, Clone)]
pub struct ResultHandler {
    inner: Arc<Mutex<Inner>>,
}

impl ResultHandler {
    fn with(completion: Completion, remaining: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                completion,
                remaining,
                results: AcknowledgementResults::new(),
                done: false,
            })),
        }
    }

    pub fn for_async() -> Self {
        Self::with(Completion::Async, 0)
    }

    /// Handler for a commitSync spread over `remaining` node states
    pub fn for_sync(future: CompletableResult<AcknowledgementResults>, remaining: usize) -> Self {
        Self::with(Completion::Sync(future), remaining)
    }

    /// Handler for a close spread over `remaining` node states
    pub fn for_close(future: CompletableResult<()>, remaining: usize) -> Self {
        Self::with(Completion::Close(future), remaining)
    }

    pub fn is_async(&self) -> bool {
        matches!(self.inner.lock().completion, Completion::Async)
    }

    /// Record the outcome of one partition's acknowledgements
    pub fn complete(&self, partition: TopicIdPartition, acknowledgements: Acknowledgements, sink: &CommitCallbackSink<'_>) {
        if acknowledgements.error().is_some() {
            metrics::record_acknowledgements_failed(acknowledgements.len());
        }
        trace!(
            partition = %partition,
            count = acknowledgements.len(),
            error = ?acknowledgements.error(),
            "Acknowledgements completed"
        );

        let mut inner = self.inner.lock();
        if matches!(inner.completion, Completion::Async) {
            drop(inner);
            sink.emit(AcknowledgementResults::from([(partition, acknowledgements)]));
            return;
        }
        match inner.results.get_mut(&partition) {
            Some(existing) => {
                let error = existing
                    .error()
                    .cloned()
                    .or_else(|| acknowledgements.error().cloned());
                let mut merged = Acknowledgements::empty();
                merged.merge(existing.clone());
                merged.merge(acknowledgements);
                merged.complete(error);
                *existing = merged;
            }
            None => {
                inner.results.insert(partition, acknowledgements);
            }
        }
    }

    /// One of the node states sharing this handler has nothing left to do
    pub fn state_done(&self, sink: &CommitCallbackSink<'_>) {
        let mut inner = self.inner.lock();
        if matches!(inner.completion, Completion::Async) {
            return;
        }
        inner.remaining = inner.remaining.saturating_sub(1);
        if inner.remaining == 0 {
            Self::finish(inner, sink);
        }
    }

    /// Complete right away when no node state was created
    pub fn complete_if_empty(&self, sink: &CommitCallbackSink<'_>) {
        let inner = self.inner.lock();
        if inner.remaining == 0 && !matches!(inner.completion, Completion::Async) {
            Self::finish(inner, sink);
        }
    }

    fn finish(mut inner: parking_lot::MutexGuard<'_, Inner>, sink: &CommitCallbackSink<'_>) {
        if inner.done {
            return;
        }
        inner.done = true;
        let results = std::mem::take(&mut inner.results);
        match &inner.completion {
            Completion::Sync(future) => {
                future.complete(results.clone());
            }
            Completion::Close(future) => {
                future.complete(());
            }
            Completion::Async => {}
        }
        drop(inner);
        sink.emit(results);
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }
}
