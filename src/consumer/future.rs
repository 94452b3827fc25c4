//! One-shot result shared between the application and background threads
//!
//! The background thread completes a [`CompletableResult`]; the application
//! thread waits on it with a bounded timeout. The first completion wins and
//! later ones are ignored.

use crate::error::{ConsumerError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct Inner<T> {
    value: Mutex<Option<Result<T>>>,
    done: Condvar,
}

/// Promise completed at most once
pub struct CompletableResult<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompletableResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CompletableResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletableResult")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Default for CompletableResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletableResult<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// Already-completed result
    pub fn completed(value: T) -> Self {
        let result = Self::new();
        result.complete(value);
        result
    }

    fn set(&self, outcome: Result<T>) -> bool {
        let mut slot = self.inner.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.inner.done.notify_all();
        true
    }

    /// Complete successfully; false if already completed
    pub fn complete(&self, value: T) -> bool {
        self.set(Ok(value))
    }

    /// Complete with an error; false if already completed
    pub fn complete_exceptionally(&self, error: ConsumerError) -> bool {
        self.set(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    /// True if both handles point at the same promise
    pub fn same_as(&self, other: &CompletableResult<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> CompletableResult<T> {
    /// Current outcome without waiting
    pub fn try_get(&self) -> Option<Result<T>> {
        self.inner.value.lock().clone()
    }

    /// Wait up to `timeout` for completion; `None` if still pending
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        let mut slot = self.inner.value.lock();
        if slot.is_none() {
            let _ = self.inner.done.wait_for(&mut slot, timeout);
        }
        slot.clone()
    }

    /// Wait up to `timeout`, turning a still-pending result into a timeout error
    pub fn get(&self, timeout: Duration) -> Result<T> {
        self.wait_for(timeout).unwrap_or_else(|| {
            Err(ConsumerError::timeout(
                "waiting for result",
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ))
        })
    }
}

/// Type-erased view used to fail pending results (deadline expiry, wakeup)
pub trait Completable: Send + Sync {
    fn fail(&self, error: ConsumerError) -> bool;

    fn is_completed(&self) -> bool;
}

impl<T: Send + 'static> Completable for CompletableResult<T> {
    fn fail(&self, error: ConsumerError) -> bool {
        self.complete_exceptionally(error)
    }

    fn is_completed(&self) -> bool {
        self.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_completion_wins() {
        let result = CompletableResult::new();
        assert!(result.complete(1));
        assert!(!result.complete(2));
        assert!(!result.complete_exceptionally(ConsumerError::Closed));
        assert_eq!(result.try_get(), Some(Ok(1)));
    }

    #[test]
    fn test_wait_for_times_out_when_pending() {
        let result: CompletableResult<u32> = CompletableResult::new();
        assert!(result.wait_for(Duration::from_millis(5)).is_none());
        assert!(matches!(
            result.get(Duration::from_millis(1)),
            Err(ConsumerError::Timeout(_))
        ));
    }

    #[test]
    fn test_completion_from_other_thread() {
        let result: CompletableResult<String> = CompletableResult::new();
        let remote = result.clone();
        let handle = thread::spawn(move || {
            remote.complete("done".to_string());
        });
        let value = result.get(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(value, "done");
        assert!(result.is_done());
    }

    #[test]
    fn test_type_erased_fail() {
        let result: CompletableResult<()> = CompletableResult::new();
        let erased: Box<dyn Completable> = Box::new(result.clone());
        assert!(erased.fail(ConsumerError::Wakeup));
        assert!(erased.is_completed());
        assert_eq!(result.try_get(), Some(Err(ConsumerError::Wakeup)));
    }
}
