//! Cooperative pause/resume gate shared by all demanders of a group.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const RUNNING: u8 = 0;
const PAUSED: u8 = 1;

/// Gate that demanders pass before issuing each demand.
///
/// Pausing only stops new demands; in-flight supply messages are still applied.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: AtomicU8,
    notify: Notify,
}

impl PauseGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate. Returns false if it was already closed.
    pub fn pause(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, PAUSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Open the gate and wake every waiter. Returns false if it was already open.
    pub fn resume(&self) -> bool {
        let resumed = self
            .state
            .compare_exchange(PAUSED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if resumed {
            self.notify.notify_waiters();
        }
        resumed
    }

    /// Whether the gate is closed.
    pub fn is_paused(&self) -> bool {
        self.state.load(Ordering::Acquire) == PAUSED
    }

    /// Wait until the gate is open. Returns false if `cancel` fires first.
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent resume is not missed.
            notified.as_mut().enable();

            if !self.is_paused() {
                return true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pause_resume_transitions() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        assert!(gate.pause());
        assert!(!gate.pause());
        assert!(gate.is_paused());
        assert!(gate.resume());
        assert!(!gate.resume());
    }

    #[tokio::test]
    async fn test_wait_resumed_blocks_until_resume() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_resumed(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_resumed_released_by_cancel() {
        let gate = PauseGate::new();
        gate.pause();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!gate.wait_resumed(&cancel).await);
    }
}
