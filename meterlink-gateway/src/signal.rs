//! Binary signal with a bounded wait.
//!
//! Platform notifications (association result, address assignment) arrive on
//! a different task than the one waiting for them. A [`Signal`] holds at most
//! one pending value; a later `give` overwrites an unconsumed one.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Signal<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Raise the signal carrying `value`.
    pub fn give(&self, value: T) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.notify.notify_one();
    }

    /// Drop a pending value, if any.
    pub fn reset(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Whether a value is pending.
    pub fn is_raised(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Wait up to `timeout` for the signal and consume its value.
    ///
    /// Returns `None` on timeout.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the slot so a concurrent give is not lost.
            notified.as_mut().enable();

            if let Some(value) = self.take() {
                return Some(value);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let signal: Signal<u8> = Signal::new();
        let start = Instant::now();

        assert_eq!(signal.wait(Duration::from_secs(30)).await, None);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_value_returned_immediately() {
        let signal = Signal::new();
        signal.give(7u8);

        assert!(signal.is_raised());
        assert_eq!(signal.wait(Duration::from_secs(1)).await, Some(7));
        assert!(!signal.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_pending_value() {
        let signal = Signal::new();
        signal.give(1u8);
        signal.reset();

        assert_eq!(signal.wait(Duration::from_millis(100)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_from_another_task() {
        let signal = Arc::new(Signal::new());
        let giver = signal.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            giver.give("up");
        });

        assert_eq!(signal.wait(Duration::from_secs(5)).await, Some("up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_value_wins() {
        let signal = Signal::new();
        signal.give(1u8);
        signal.give(2u8);

        assert_eq!(signal.wait(Duration::from_secs(1)).await, Some(2));
        assert_eq!(signal.wait(Duration::from_millis(10)).await, None);
    }
}
