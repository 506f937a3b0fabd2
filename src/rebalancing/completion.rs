//! One-shot completion cell with listeners.
//!
//! The first call to [`Completion::complete`] wins; later calls are ignored.
//! Listeners registered after completion run immediately with the stored value.

use parking_lot::Mutex;
use tokio::sync::watch;

type Listener<T> = Box<dyn FnOnce(T) + Send>;

struct State<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
}

/// A value that is set exactly once and can be awaited or listened for.
pub struct Completion<T: Clone + Send + Sync + 'static> {
    state: Mutex<State<T>>,
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    /// Create an incomplete cell.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            state: Mutex::new(State {
                value: None,
                listeners: Vec::new(),
            }),
            tx,
        }
    }

    /// Complete with `value`. Returns false if already completed.
    pub fn complete(&self, value: T) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            std::mem::take(&mut state.listeners)
        };

        self.tx.send_replace(Some(value.clone()));

        for listener in listeners {
            listener(value.clone());
        }
        true
    }

    /// Run `f` with the value once completed, or right away if already completed.
    pub fn on_complete(&self, f: impl FnOnce(T) + Send + 'static) {
        let mut state = self.state.lock();
        match state.value.clone() {
            Some(value) => {
                drop(state);
                f(value);
            }
            None => state.listeners.push(Box::new(f)),
        }
    }

    /// The value, if completed.
    pub fn get(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Whether the cell has been completed.
    pub fn is_done(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Wait for completion.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so the channel stays open while borrowed.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_completion_wins() {
        let c = Completion::new();
        assert!(c.complete(1));
        assert!(!c.complete(2));
        assert_eq!(c.get(), Some(1));
    }

    #[test]
    fn test_late_listener_invoked_immediately() {
        let c = Completion::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let early = calls.clone();
        c.on_complete(move |v: u32| {
            early.fetch_add(v as usize, Ordering::SeqCst);
        });
        c.complete(5);

        let late = calls.clone();
        c.on_complete(move |v| {
            late.fetch_add(v as usize, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_wait_across_tasks() {
        let c = Arc::new(Completion::new());
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        c.complete("done");

        assert_eq!(waiter.await.unwrap(), "done");
        assert_eq!(c.wait().await, "done");
    }
}
