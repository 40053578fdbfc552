use std::sync::Arc;

use tokio::sync::watch;

/// A multi-producer multi-consumer channel that delivers a single "stop now"
/// signal to every long-running task in a group.
///
/// - Clone the handle to hand it to another task; every clone observes the
///   signal, including clones created after the signal was sent.
/// - Sending more than once is harmless.
/// - [`recv`] completes immediately if the signal was already sent, so tasks
///   spawned late still wind down.
///
/// Built on [`tokio::sync::watch`]: sending flips the watched flag, receiving
/// waits for the flag to become `true`.
///
/// [`recv`]: ShutdownSignal::recv
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Send the shutdown signal to all handles, current and future.
    pub fn send(&self) {
        // Error only if there are no receivers; we always hold one ourselves.
        let _ = self.tx.send(true);
    }

    /// Wait for the shutdown signal.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // The sender half lives inside `self`, so `changed()` cannot fail.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    /// Wait for the shutdown signal, consuming the handle. Useful for APIs
    /// that require `impl Future<Output = ()> + 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Whether the signal has been sent, without waiting.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[test]
    fn multiple_sends_dont_panic() {
        let shutdown = ShutdownSignal::new();
        shutdown.send();
        shutdown.send();
    }

    #[test]
    fn all_clones_observe_signal() {
        use tokio_test::{assert_pending, assert_ready};

        let shutdown1 = ShutdownSignal::new();
        let mut shutdown2 = shutdown1.clone();

        let mut recv2 = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv2.poll());

        shutdown1.send();
        assert!(recv2.is_woken());
        assert_ready!(recv2.poll());
        drop(recv2);

        // A clone taken after the signal also observes it, immediately.
        let mut shutdown3 = shutdown1.clone();
        assert!(shutdown3.is_sent());
        let mut recv3 = tokio_test::task::spawn(shutdown3.recv());
        assert_ready!(recv3.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_does_not_hang() {
        let shutdown1 = ShutdownSignal::new();
        let mut shutdown2 = shutdown1.clone();
        time::sleep(Duration::from_secs(1)).await;
        shutdown1.send();
        time::timeout(Duration::from_nanos(1), shutdown2.recv())
            .await
            .expect("recv() after send() should complete immediately");
    }
}
