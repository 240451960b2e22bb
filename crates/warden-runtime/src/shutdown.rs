//! Tracks in-flight work during shutdown so the engine can wait for every
//! container's stop hook to finish before it reports itself stopped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// An `Arc`-shared counter of outstanding stop operations. `begin()` bumps it
/// and returns a guard; dropping the guard decrements it and, if it reaches
/// zero, wakes anyone parked in [`ShutdownCounter::wait`].
#[derive(Debug, Default)]
pub struct ShutdownCounter {
    count: AtomicUsize,
    notify: Notify,
}

impl ShutdownCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin(self: &Arc<Self>) -> ShutdownGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ShutdownGuard {
            counter: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until every outstanding guard has dropped, or `timeout` elapses.
    /// Returns `true` if it drained cleanly.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.outstanding() == 0 {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                if self.outstanding() == 0 {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .is_ok()
    }
}

pub struct ShutdownGuard {
    counter: Arc<ShutdownCounter>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.counter.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_for_every_guard_to_drop() {
        let counter = ShutdownCounter::new();
        let guard_a = counter.begin();
        let guard_b = counter.begin();
        assert_eq!(counter.outstanding(), 2);

        let counter2 = Arc::clone(&counter);
        let waiter = tokio::spawn(async move { counter2.wait(Duration::from_secs(1)).await });

        drop(guard_a);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard_b);

        assert!(waiter.await.unwrap());
        assert_eq!(counter.outstanding(), 0);
    }

    #[tokio::test]
    async fn times_out_if_never_drained() {
        let counter = ShutdownCounter::new();
        let _guard = counter.begin();
        assert!(!counter.wait(Duration::from_millis(20)).await);
    }
}
