//! Cancellable scheduled tasks
//!
//! [`schedule`] runs a future once after a delay. The returned
//! [`ScheduledTask`] can be cancelled; `cancel` reports whether it actually
//! stopped a pending timer, so a timer that already fired or was already
//! cancelled is never counted twice.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a future scheduled with [`schedule`]
#[derive(Debug)]
pub struct ScheduledTask {
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

/// Run `task` once after `delay`. Must be called inside a tokio runtime.
pub fn schedule<F>(delay: Duration, task: F) -> ScheduledTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AtomicU8::new(PENDING));
    let timer_state = state.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if timer_state
            .compare_exchange(PENDING, FIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            trace!("Scheduled task fired after {:?}", delay);
            task.await;
        }
    });
    ScheduledTask { state, handle }
}

impl ScheduledTask {
    /// Stop the timer. Returns true only if it had not fired or been cancelled yet.
    pub fn cancel(&self) -> bool {
        let stopped = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if stopped {
            self.handle.abort();
        }
        stopped
    }

    /// True while the timer has neither fired nor been cancelled
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FIRED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = schedule(Duration::from_millis(10), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(task.is_active());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(task.has_fired());
        assert!(!task.cancel());
    }

    #[tokio::test]
    async fn cancel_prevents_firing_and_counts_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = schedule(Duration::from_millis(20), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(task.cancel());
        assert!(!task.cancel());
        assert!(!task.is_active());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
