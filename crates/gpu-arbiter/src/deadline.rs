//! Cancelable one-shot timers for queue deadlines and lease watchdogs

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// A timer that either fires its action or is cancelled, never both.
///
/// The action runs on the runtime the deadline was armed on. Whichever of
/// `cancel` and the timer wins the state transition decides the outcome.
#[derive(Debug)]
pub struct Deadline {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl Deadline {
    /// Arm a deadline that runs `on_fire` after `after`
    pub fn arm<F>(runtime: &Handle, after: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let at = Instant::now() + after;

        let task_state = Arc::clone(&state);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(at).await;
            if task_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                on_fire();
            }
        });

        Self { state, task }
    }

    /// Cancel the deadline; returns false if it already fired or was cancelled
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.task.abort();
        }
        cancelled
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let deadline = Deadline::arm(&Handle::current(), Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!deadline.has_fired());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(deadline.has_fired());
        assert!(!deadline.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadline_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let deadline = Deadline::arm(&Handle::current(), Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(deadline.cancel());
        assert!(deadline.is_cancelled());
        assert!(!deadline.cancel());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
