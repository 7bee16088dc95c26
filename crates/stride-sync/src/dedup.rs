//! Request deduplication
//!
//! Collapses concurrent identical calls into one underlying request. The
//! first caller for a key owns the producing future; every caller that
//! arrives while it is in flight attaches to the same settled outcome. The
//! registration is removed the instant the call settles, success or error,
//! so the next call for that key performs fresh work.

use crate::error::{ErrorKind, Result, SyncError};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::broadcast;

type Settled = Result<Value>;

/// Instance-owned registry of in-flight calls
#[derive(Debug, Default)]
pub struct DedupRegistry {
    in_flight: Mutex<HashMap<String, broadcast::Sender<Settled>>>,
}

/// Removes the registration if the owning future is dropped mid-flight, so
/// attached callers see a closed channel instead of waiting forever.
struct EntryGuard<'a> {
    registry: &'a DedupRegistry,
    key: &'a str,
    settled: bool,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            if let Ok(mut map) = self.registry.in_flight.lock() {
                map.remove(self.key);
            }
        }
    }
}

impl DedupRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Run `producer` once per key, sharing its outcome with every
    /// concurrent caller for the same key
    pub async fn dedupe<F, Fut>(&self, key: &str, producer: F) -> Settled
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Settled>,
    {
        self.dedupe_tracking(key, producer).await.0
    }

    /// Like [`dedupe`](Self::dedupe), also reporting whether the caller
    /// attached to an already in-flight call
    pub async fn dedupe_tracking<F, Fut>(&self, key: &str, producer: F) -> (Settled, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Settled>,
    {
        let attached = {
            let Ok(mut map) = self.in_flight.lock() else {
                // Degraded registry: just do the work undeduplicated
                return (producer().await, false);
            };
            match map.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    map.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = attached {
            let settled = match receiver.recv().await {
                Ok(settled) => settled,
                Err(_) => Err(SyncError::new(
                    ErrorKind::Unknown,
                    "deduplicated call was cancelled before settling",
                )),
            };
            return (settled, true);
        }

        let mut guard = EntryGuard {
            registry: self,
            key,
            settled: false,
        };
        let settled = producer().await;

        // Clear the registration before fanning out, so a caller arriving
        // now starts fresh work instead of attaching to a settled entry
        let sender = match self.in_flight.lock() {
            Ok(mut map) => map.remove(key),
            Err(_) => None,
        };
        guard.settled = true;
        if let Some(sender) = sender {
            let _ = sender.send(settled.clone());
        }
        (settled, false)
    }
}
