use tokio::sync::broadcast;

/// A typed pub-sub bus for worker events.
///
/// - Clone the bus to get another publishing handle.
/// - [`notify`] is a no-op if nobody is subscribed, which is the common case.
/// - [`subscribe`] only observes events published after the call.
///
/// Built on [`tokio::sync::broadcast`]: slow subscribers that lag behind drop
/// old events rather than blocking publishers.
///
/// [`notify`]: EventsBus::notify
/// [`subscribe`]: EventsBus::subscribe
#[derive(Clone)]
pub struct EventsBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventsBus<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(crate::DEFAULT_CHANNEL_SIZE).0,
        }
    }

    /// Publish an event to all current subscribers.
    pub fn notify(&self, event: T) {
        // `send` errors iff there are no receivers; that's fine.
        let _ = self.tx.send(event);
    }

    /// Start listening for events published after this point.
    pub fn subscribe(&self) -> EventsRx<T> {
        EventsRx {
            // Keep a sender half alive so the channel can't close while a
            // subscriber still waits on it.
            _tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

pub struct EventsRx<T> {
    _tx: broadcast::Sender<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventsRx<T> {
    /// Wait for the next event. Skips over events lost to lagging.
    pub async fn recv(&mut self) -> T {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.rx.recv().await {
                Ok(event) => return event,
                // We hold a sender handle, so the channel can't be closed.
                Err(RecvError::Closed) => unreachable!(
                    "broadcast channel closed with a live sender handle"
                ),
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Wait for the next event for which `filter` returns true. Callers
    /// should wrap this in a timeout.
    pub async fn next_filtered(&mut self, filter: impl Fn(&T) -> bool) -> T {
        loop {
            let event = self.recv().await;
            if filter(&event) {
                return event;
            }
        }
    }
}
