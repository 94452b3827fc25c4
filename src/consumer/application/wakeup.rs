//! Cross-thread interruption of blocking application calls

use crate::consumer::future::{Completable, CompletableResult};
use crate::error::{ConsumerError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct WakeupState {
    pending: bool,
    active: Option<Arc<dyn Completable>>,
}

/// Interrupts the wait an application call is blocked in
///
/// `wakeup()` fails the wait currently registered with
/// [`set_active_task`](Self::set_active_task); with no wait registered it
/// leaves a pending flag that the next blocking call observes.
#[derive(Clone, Default)]
pub struct WakeupTrigger {
    state: Arc<Mutex<WakeupState>>,
}

impl WakeupTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wakeup(&self) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.take() {
            if active.fail(ConsumerError::Wakeup) {
                return;
            }
        }
        state.pending = true;
    }

    /// Register `task` as the wait to interrupt. A pending wakeup fails it
    /// right away and is consumed.
    pub fn set_active_task<T: Send + 'static>(&self, task: &CompletableResult<T>) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending {
            state.pending = false;
            task.complete_exceptionally(ConsumerError::Wakeup);
            return Err(ConsumerError::Wakeup);
        }
        state.active = Some(Arc::new(task.clone()));
        Ok(())
    }

    pub fn clear_task(&self) {
        self.state.lock().active = None;
    }

    /// Consume a pending wakeup
    pub fn maybe_trigger_wakeup(&self) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.pending) {
            return Err(ConsumerError::Wakeup);
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }
}
