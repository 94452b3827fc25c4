//! Unbounded event channel with a size gauge

use crate::error::{ConsumerError, Result};
use crate::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Create a named queue; the name labels the size gauge
pub fn event_queue<E>(name: &'static str) -> (EventSender<E>, EventReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let size = Arc::new(AtomicUsize::new(0));
    (
        EventSender {
            tx,
            size: Arc::clone(&size),
            name,
        },
        EventReceiver { rx, size, name },
    )
}

/// Producer half; cheap to clone and safe to use from any thread
pub struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
    size: Arc<AtomicUsize>,
    name: &'static str,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            size: Arc::clone(&self.size),
            name: self.name,
        }
    }
}

impl<E> EventSender<E> {
    /// Enqueue an event. Fails with `Closed` once the receiver is gone.
    pub fn add(&self, event: E) -> Result<()> {
        // counted before sending so a concurrent drain never underflows
        let size = self.size.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(event).is_err() {
            self.size.fetch_sub(1, Ordering::AcqRel);
            return Err(ConsumerError::Closed);
        }
        metrics::update_queue_size(self.name, size);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by a single thread
pub struct EventReceiver<E> {
    rx: mpsc::UnboundedReceiver<E>,
    size: Arc<AtomicUsize>,
    name: &'static str,
}

impl<E> EventReceiver<E> {
    /// Remove and return everything currently queued, in FIFO order
    pub fn drain_events(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if !events.is_empty() {
            let size = self
                .size
                .fetch_sub(events.len(), Ordering::AcqRel)
                .saturating_sub(events.len());
            metrics::update_queue_size(self.name, size);
        }
        events
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_drain_returns_fifo_order() {
        let (tx, mut rx) = event_queue::<u32>("test");
        for i in 0..5 {
            tx.add(i).unwrap();
        }
        assert_eq!(rx.size(), 5);
        assert_eq!(rx.drain_events(), vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
        assert!(rx.drain_events().is_empty());
    }

    #[test]
    fn test_events_survive_until_drained() {
        let (tx, mut rx) = event_queue::<&str>("test");
        tx.add("a").unwrap();
        let first = rx.drain_events();
        tx.add("b").unwrap();
        tx.add("c").unwrap();
        assert_eq!(first, vec!["a"]);
        assert_eq!(rx.drain_events(), vec!["b", "c"]);
    }

    #[test]
    fn test_add_from_many_threads() {
        let (tx, mut rx) = event_queue::<usize>("test");
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        tx.add(t * 100 + i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(rx.drain_events().len(), 400);
    }

    #[test]
    fn test_add_after_receiver_dropped_fails() {
        let (tx, rx) = event_queue::<u8>("test");
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.add(1), Err(ConsumerError::Closed));
    }
}
