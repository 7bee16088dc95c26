//! Durable offline mutation queue
//!
//! Mutations that cannot be committed remotely are parked here and replayed
//! when connectivity returns. The queue is persisted after every change to
//! itself so a crash mid-sync cannot duplicate work, suppresses near-duplicate
//! enqueues, counts retries per entry, and drops entries that keep failing on
//! the assumption that a deterministic bug rather than transient failure is
//! at play. It never polls; the connectivity watcher's reconnect signal is
//! the trigger for `sync`.

use crate::error::{Result, SyncError};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle state of a queued entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting for a replay
    Queued,
    /// Currently being replayed
    Syncing,
}

/// One parked mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Unique entry id
    pub id: String,
    /// Session scope the mutation belongs to
    pub owner: Option<String>,
    /// Opaque mutation payload
    pub payload: Value,
    /// When the entry was created
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far; monotonic
    pub retry_count: u32,
    /// Lifecycle state
    pub status: MutationStatus,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failed attempts after which an entry is dropped
    pub max_retries: u32,
    /// Window for near-duplicate suppression
    pub duplicate_tolerance: Duration,
    /// Persistence key
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            duplicate_tolerance: Duration::from_secs(60),
            storage_key: "offline_queue".to_string(),
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// False when a near-duplicate already covered this mutation and its id
    /// was reused
    pub queued: bool,
    /// Id of the entry covering the mutation
    pub id: String,
}

/// What one `sync` pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries confirmed remotely and removed
    pub replayed: usize,
    /// Entries that failed and went back to queued
    pub failed: usize,
    /// Entry ids dropped at the retry ceiling, for "failed permanently" UI
    pub dropped: Vec<String>,
}

/// Durable, ordered queue of deferred mutations
pub struct OfflineQueue {
    config: QueueConfig,
    storage: Arc<dyn KeyValueStore>,
    entries: Mutex<Vec<QueuedMutation>>,
    connectivity: watch::Receiver<bool>,
    id_counter: AtomicU64,
}

impl OfflineQueue {
    /// Open the queue, loading any persisted entries
    ///
    /// Entries left `syncing` by a crash are restored to `queued` so they
    /// are replayed rather than stranded.
    pub fn new(
        config: QueueConfig,
        storage: Arc<dyn KeyValueStore>,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        let mut entries: Vec<QueuedMutation> = storage
            .get(&config.storage_key)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        for entry in &mut entries {
            entry.status = MutationStatus::Queued;
        }
        Self {
            config,
            storage,
            entries: Mutex::new(entries),
            connectivity,
            id_counter: AtomicU64::new(0),
        }
    }

    /// Number of parked entries
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current entries
    pub fn entries(&self) -> Vec<QueuedMutation> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Park a mutation, reusing a near-duplicate entry when one exists
    pub fn enqueue(&self, payload: Value, owner: Option<&str>) -> EnqueueOutcome {
        let now = Utc::now();
        let Ok(mut entries) = self.entries.lock() else {
            return EnqueueOutcome {
                queued: false,
                id: String::new(),
            };
        };

        let tolerance = self.config.duplicate_tolerance;
        if let Some(existing) = entries.iter().find(|e| {
            e.owner.as_deref() == owner
                && within_tolerance(e.enqueued_at, now, tolerance)
                && payloads_match(&e.payload, &payload, tolerance)
        }) {
            return EnqueueOutcome {
                queued: false,
                id: existing.id.clone(),
            };
        }

        let id = format!(
            "m-{}-{}",
            now.timestamp_millis(),
            self.id_counter.fetch_add(1, Ordering::SeqCst)
        );
        entries.push(QueuedMutation {
            id: id.clone(),
            owner: owner.map(str::to_string),
            payload,
            enqueued_at: now,
            retry_count: 0,
            status: MutationStatus::Queued,
        });
        self.persist(&entries);
        EnqueueOutcome { queued: true, id }
    }

    /// Replay queued entries through `replay_fn`, oldest first
    ///
    /// No-op while offline. Entries are processed sequentially to avoid
    /// bursting the remote store; overlapping invocations must be
    /// serialized by the caller (the debounced reconnect trigger).
    pub async fn sync<F, Fut>(&self, replay_fn: F, owner_scope: Option<&str>) -> SyncReport
    where
        F: Fn(QueuedMutation) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let mut report = SyncReport::default();
        if !*self.connectivity.borrow() {
            log::debug!("offline, skipping queue sync");
            return report;
        }

        let candidates: Vec<String> = {
            let Ok(entries) = self.entries.lock() else {
                return report;
            };
            entries
                .iter()
                .filter(|e| owner_scope.is_none() || e.owner.as_deref() == owner_scope)
                .map(|e| e.id.clone())
                .collect()
        };

        for id in candidates {
            let entry = {
                let Ok(mut entries) = self.entries.lock() else {
                    return report;
                };
                let Some(position) = entries.iter().position(|e| e.id == id) else {
                    continue;
                };
                if entries[position].retry_count >= self.config.max_retries {
                    let dropped = entries.remove(position);
                    self.persist(&entries);
                    log::warn!(
                        "dropping queued mutation {} after {} failed attempts",
                        dropped.id,
                        dropped.retry_count
                    );
                    report.dropped.push(dropped.id);
                    continue;
                }
                entries[position].status = MutationStatus::Syncing;
                self.persist(&entries);
                entries[position].clone()
            };

            match replay_fn(entry).await {
                Ok(_) => {
                    if let Ok(mut entries) = self.entries.lock() {
                        entries.retain(|e| e.id != id);
                        self.persist(&entries);
                    }
                    report.replayed += 1;
                }
                Err(error) => {
                    if let Ok(mut entries) = self.entries.lock() {
                        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                            entry.retry_count += 1;
                            entry.status = MutationStatus::Queued;
                        }
                        self.persist(&entries);
                    }
                    log::warn!("queued mutation {id} failed to replay: {error}");
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn persist(&self, entries: &[QueuedMutation]) {
        if let Ok(raw) = serde_json::to_string(entries) {
            self.storage.set(&self.config.storage_key, &raw);
        }
    }
}

fn within_tolerance(a: DateTime<Utc>, b: DateTime<Utc>, tolerance: Duration) -> bool {
    let delta = (b - a).num_milliseconds().unsigned_abs();
    delta <= tolerance.as_millis() as u64
}

/// Field-by-field payload comparison with timestamp tolerance
///
/// Two payloads describe the same logical mutation when every field is
/// equal, except that RFC3339 timestamp strings only need to fall within
/// the tolerance window of each other.
fn payloads_match(a: &Value, b: &Value, tolerance: Duration) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.get(key)
                        .is_some_and(|other| payloads_match(value, other, tolerance))
                })
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|(x, y)| payloads_match(x, y, tolerance))
        }
        (Value::String(a), Value::String(b)) => {
            match (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(ta), Ok(tb)) => {
                    within_tolerance(ta.with_timezone(&Utc), tb.with_timezone(&Utc), tolerance)
                }
                _ => a == b,
            }
        }
        _ => a == b,
    }
}
