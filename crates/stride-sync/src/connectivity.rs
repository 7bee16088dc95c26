//! Connectivity collaborator seam
//!
//! The platform layer feeds online/offline transitions into a
//! [`ConnectivityMonitor`]; the sync layer consumes the watch channel and
//! fires a debounced callback once per reconnect, which is the trigger for
//! offline-queue replay. The debounce is also what serializes overlapping
//! sync invocations, since the queue itself does not.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Shared online/offline state
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    /// Record a connectivity change reported by the platform
    pub fn set_online(&self, online: bool) {
        // send_replace never fails even with no active receivers
        let previous = self.tx.send_replace(online);
        if previous != online {
            debug!(online, "connectivity changed");
        }
    }

    /// Current connectivity state
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Fire `callback` once per offline-to-online transition
    ///
    /// The callback runs after `debounce` has elapsed with the connection
    /// still up, so a flapping link produces one replay, not a burst.
    pub fn on_reconnect<F, Fut>(&self, debounce: Duration, callback: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            let mut was_online = *rx.borrow();
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                if online && !was_online {
                    tokio::time::sleep(debounce).await;
                    if *rx.borrow() {
                        info!("connectivity restored, triggering sync");
                        callback().await;
                    }
                }
                was_online = *rx.borrow();
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
