//! Stride Sync - resilient remote-sync layer for the Stride app
//!
//! Everything Stride reads or writes against its remote data store flows
//! through this crate. It exists so that an unreliable network and a
//! sometimes-absent connection do not surface as lost workouts or duplicate
//! meals:
//!
//! - **Error classification**: every failure is normalized into a
//!   [`SyncError`] whose `retryable` flag is the single source of truth for
//!   retry decisions
//! - **Request execution**: deadlines, exponential backoff with jitter, and
//!   bounded retries per call
//! - **Deduplication**: concurrent identical reads share one network call
//! - **Rate limiting**: persisted per-operation sliding windows with
//!   optional queueing for overflow
//! - **Offline queueing**: mutations that fail terminally on a transient
//!   classification are parked durably and replayed on reconnect
//! - **Optimistic updates**: snapshot/rollback helper for callers that
//!   update local state before remote confirmation
//!
//! The layer is generic over payload shape: bodies and results are
//! `serde_json::Value`. Authentication, connectivity signals, and durable
//! storage are injected collaborators.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stride_sync::{
//!     FileStore, StaticTokenProvider, SyncClient, SyncClientConfig,
//! };
//!
//! # async fn example() -> Result<(), stride_sync::SyncError> {
//! let config = SyncClientConfig::new("https://store.example.com", "anon-key");
//! let client = Arc::new(SyncClient::new(
//!     config,
//!     Arc::new(StaticTokenProvider::new("user-token")),
//!     Arc::new(FileStore::new("sync-state.json")),
//! )?);
//!
//! // Replay parked mutations whenever connectivity returns
//! client.clone().spawn_reconnect_sync();
//!
//! let workouts = client
//!     .select("/rest/v1/workouts", &[("user_id", "eq.7")])
//!     .await;
//! # let _ = workouts;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod client;
pub mod connectivity;
pub mod dedup;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod operation;
pub mod optimistic;
pub mod queue;
pub mod rate_limit;
pub mod response;
pub mod storage;

pub use auth::{spawn_auth_refresh, AuthEvent, StaticTokenProvider, TokenProvider};
pub use backoff::BackoffPolicy;
pub use client::{MutationOutcome, SyncClient, SyncClientConfig};
pub use connectivity::ConnectivityMonitor;
pub use dedup::DedupRegistry;
pub use diagnostics::{AttemptOutcome, AttemptRecord, RequestLog};
pub use error::{ErrorKind, Result, SyncError};
pub use executor::{
    ExecutorConfig, HttpTransport, RawResponse, RequestExecutor, Transport, TransportError,
};
pub use operation::{Method, Operation, OperationClass, Prefer, RequestFactory};
pub use optimistic::{OptimisticFailure, OptimisticStore};
pub use queue::{
    EnqueueOutcome, MutationStatus, OfflineQueue, QueueConfig, QueuedMutation, SyncReport,
};
pub use rate_limit::{RateLimitConfig, RateLimitRule, RateLimitStatus, RateLimiter};
pub use response::{Envelope, EnvelopeMeta};
pub use storage::{FileStore, KeyValueStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
