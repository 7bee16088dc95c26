//! Client facade over the sync layer
//!
//! Wires the pipeline the rest of the app talks to: a call is admitted by
//! the rate limiter, collapsed with identical in-flight reads by the dedup
//! registry, executed with retries by the executor, and - for essential
//! mutations - parked in the offline queue when it fails terminally. All
//! state is owned by the client instance; nothing in this crate is ambient.

use crate::auth::TokenProvider;
use crate::connectivity::ConnectivityMonitor;
use crate::dedup::DedupRegistry;
use crate::diagnostics::RequestLog;
use crate::error::{ErrorKind, Result, SyncError};
use crate::executor::{ExecutorConfig, HttpTransport, RequestExecutor, Transport};
use crate::operation::{Method, Operation, Prefer, RequestFactory};
use crate::queue::{OfflineQueue, QueueConfig, SyncReport};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::response::{Envelope, EnvelopeMeta};
use crate::storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Client configuration
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Remote store base URL
    pub base_url: String,
    /// Store API key, sent on every request
    pub api_key: String,
    /// Executor retry/deadline settings
    pub executor: ExecutorConfig,
    /// Per-operation rate-limit table
    pub rate_limits: RateLimitConfig,
    /// Offline queue settings
    pub queue: QueueConfig,
    /// Collapse concurrent identical reads
    pub dedupe_reads: bool,
    /// Quiet period after a reconnect before replaying the queue
    pub reconnect_debounce: Duration,
}

impl SyncClientConfig {
    /// Defaults for the given endpoint
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            executor: ExecutorConfig::default(),
            rate_limits: RateLimitConfig::default(),
            queue: QueueConfig::default(),
            dedupe_reads: true,
            reconnect_debounce: Duration::from_secs(2),
        }
    }
}

/// How a `mutate_or_queue` call ended
#[derive(Debug)]
pub enum MutationOutcome {
    /// Confirmed remotely
    Committed(Value),
    /// Failed terminally on a transient classification; parked for replay
    Queued {
        /// Offline queue entry id
        id: String,
        /// The error that sent it to the queue
        error: SyncError,
    },
    /// Failed permanently; not worth queueing
    Failed(SyncError),
}

/// Serialized form of an operation inside a queued mutation payload
#[derive(Debug, Serialize, Deserialize)]
struct QueuedOperation {
    name: String,
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    on_conflict: Option<String>,
}

impl QueuedOperation {
    fn from_operation(op: &Operation) -> Self {
        let on_conflict = match &op.prefer {
            Prefer::Merge { on_conflict } => Some(on_conflict.clone()),
            _ => None,
        };
        Self {
            name: op.name.clone(),
            method: op.method.to_string(),
            path: op.path.clone(),
            query: op.query.clone(),
            body: op.body.clone(),
            on_conflict,
        }
    }

    fn into_operation(self) -> Result<Operation> {
        let method = match self.method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            other => {
                return Err(SyncError::new(
                    ErrorKind::Validation,
                    format!("queued mutation has unsupported method: {other}"),
                ))
            }
        };
        let mut op = Operation::write(self.name, method, self.path, Value::Null);
        op.body = self.body;
        op.query = self.query;
        if let Some(on_conflict) = self.on_conflict {
            op = op.with_prefer(Prefer::Merge { on_conflict });
        }
        Ok(op)
    }
}

/// The sync layer's entry point
pub struct SyncClient {
    factory: RequestFactory,
    executor: RequestExecutor,
    dedup: DedupRegistry,
    rate_limiter: RateLimiter,
    queue: OfflineQueue,
    connectivity: Arc<ConnectivityMonitor>,
    tokens: Arc<dyn TokenProvider>,
    dedupe_reads: bool,
    reconnect_debounce: Duration,
}

impl SyncClient {
    /// Create a client over the production HTTP transport
    pub fn new(
        config: SyncClientConfig,
        tokens: Arc<dyn TokenProvider>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()), tokens, storage)
    }

    /// Create a client over an explicit transport
    pub fn with_transport(
        config: SyncClientConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let factory = RequestFactory::new(&config.base_url, config.api_key.clone())?;
        let executor = RequestExecutor::new(transport, config.executor.clone());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let queue = OfflineQueue::new(
            config.queue.clone(),
            storage.clone(),
            connectivity.subscribe(),
        );
        let rate_limiter = RateLimiter::new(config.rate_limits.clone(), storage);

        Ok(Self {
            factory,
            executor,
            dedup: DedupRegistry::new(),
            rate_limiter,
            queue,
            connectivity,
            tokens,
            dedupe_reads: config.dedupe_reads,
            reconnect_debounce: config.reconnect_debounce,
        })
    }

    /// Connectivity state shared with the platform layer
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Register an observer for auth-refresh notifications
    pub fn subscribe_auth_events(&self) -> tokio::sync::broadcast::Receiver<crate::auth::AuthEvent> {
        self.executor.subscribe_auth_events()
    }

    /// The executor's diagnostics ring buffer
    pub fn request_log(&self) -> Arc<RequestLog> {
        self.executor.request_log()
    }

    /// The offline queue, for inspection
    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Run one operation through the full admission pipeline
    pub async fn call(&self, op: Operation) -> Envelope {
        let started = Instant::now();
        let dedupe = self.dedupe_reads && !op.is_mutation();

        let (result, cached) = self
            .rate_limiter
            .with_limit(&op.name, || async {
                if dedupe {
                    Ok(self
                        .dedup
                        .dedupe_tracking(&op.dedupe_key(), || self.execute_raw(&op))
                        .await)
                } else {
                    Ok((self.execute_raw(&op).await, false))
                }
            })
            .await
            .unwrap_or_else(|rate_err| (Err(rate_err), false));

        let duration_ms = started.elapsed().as_millis() as u64;
        Envelope::from_result(result, Some(EnvelopeMeta::now(duration_ms, cached)))
    }

    /// Read rows from a resource path
    pub async fn select(&self, path: &str, query: &[(&str, &str)]) -> Envelope {
        let mut op = Operation::read("records.read", path);
        for (key, value) in query {
            op = op.with_query(*key, *value);
        }
        self.call(op).await
    }

    /// Insert a row
    pub async fn insert(&self, path: &str, body: Value) -> Envelope {
        self.call(Operation::write("records.write", Method::POST, path, body))
            .await
    }

    /// Patch rows matching the query
    pub async fn update(&self, path: &str, query: &[(&str, &str)], body: Value) -> Envelope {
        let mut op = Operation::write("records.write", Method::PATCH, path, body);
        for (key, value) in query {
            op = op.with_query(*key, *value);
        }
        self.call(op).await
    }

    /// Upsert with merge-on-conflict semantics
    pub async fn upsert(&self, path: &str, body: Value, on_conflict: &str) -> Envelope {
        let op = Operation::write("records.write", Method::POST, path, body).with_prefer(
            Prefer::Merge {
                on_conflict: on_conflict.to_string(),
            },
        );
        self.call(op).await
    }

    /// Delete rows matching the query
    pub async fn delete(&self, path: &str, query: &[(&str, &str)]) -> Envelope {
        let mut op = Operation::write("records.write", Method::DELETE, path, Value::Null)
            .with_prefer(Prefer::Minimal);
        op.body = None;
        for (key, value) in query {
            op = op.with_query(*key, *value);
        }
        self.call(op).await
    }

    /// Call a remote procedure
    pub async fn rpc(&self, function: &str, args: Value) -> Envelope {
        self.call(Operation::rpc(
            "rpc.call",
            format!("/rest/v1/rpc/{function}"),
            args,
        ))
        .await
    }

    /// Commit an essential mutation, parking it for replay when it fails
    /// on a transient classification
    pub async fn mutate_or_queue(&self, op: Operation, owner: Option<&str>) -> MutationOutcome {
        let offline = !self.connectivity.is_online();
        let result = if offline {
            Err(SyncError::network("offline"))
        } else {
            self.call(op.clone()).await.into_result()
        };

        match result {
            Ok(value) => MutationOutcome::Committed(value),
            Err(error) if error.retryable => {
                let payload = match serde_json::to_value(QueuedOperation::from_operation(&op)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        return MutationOutcome::Failed(SyncError::new(
                            ErrorKind::Validation,
                            format!("mutation payload not serializable: {e}"),
                        ))
                    }
                };
                let outcome = self.queue.enqueue(payload, owner);
                log::info!(
                    "mutation {} parked for replay as {}",
                    op.name,
                    outcome.id
                );
                MutationOutcome::Queued {
                    id: outcome.id,
                    error,
                }
            }
            Err(error) => MutationOutcome::Failed(error),
        }
    }

    /// Replay parked mutations through the executor
    pub async fn sync_offline(&self, owner_scope: Option<&str>) -> SyncReport {
        self.queue
            .sync(
                |entry| async move {
                    let queued: QueuedOperation = serde_json::from_value(entry.payload)?;
                    let op = queued.into_operation()?;
                    self.execute_raw(&op).await
                },
                owner_scope,
            )
            .await
    }

    /// Replay the whole queue on each debounced reconnect
    pub fn spawn_reconnect_sync(self: Arc<Self>) -> JoinHandle<()> {
        let debounce = self.reconnect_debounce;
        let connectivity = self.connectivity.clone();
        connectivity.on_reconnect(debounce, move || {
            let client = self.clone();
            async move {
                let report = client.sync_offline(None).await;
                log::info!(
                    "reconnect sync: {} replayed, {} failed, {} dropped",
                    report.replayed,
                    report.failed,
                    report.dropped.len()
                );
            }
        })
    }

    /// One attempt pipeline: current credentials, built request, executor
    async fn execute_raw(&self, op: &Operation) -> Result<Value> {
        self.executor
            .execute(op, || async {
                let token = self.tokens.current_token().await;
                // A token the provider no longer vouches for is omitted so
                // the call proceeds with the anonymous key instead of a
                // guaranteed 401
                let bearer = token.filter(|t| self.tokens.is_token_fresh(t));
                self.factory.build(op, bearer.as_deref())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::executor::test_support::{fast_config, Script, ScriptedTransport};
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn client(script: Vec<Script>) -> (Arc<SyncClient>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(script));
        let mut config = SyncClientConfig::new("https://store.example.com", "anon-key");
        config.executor = fast_config();
        config.reconnect_debounce = Duration::from_millis(10);
        let client = SyncClient::with_transport(
            config,
            transport.clone(),
            Arc::new(StaticTokenProvider::new("user-token")),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        (Arc::new(client), transport)
    }

    #[tokio::test]
    async fn test_select_returns_enveloped_rows() {
        let (client, _) = client(vec![Script::Respond(200, r#"[{"id": 1}]"#)]);
        let envelope = client
            .select("/rest/v1/workouts", &[("user_id", "eq.7")])
            .await;
        assert!(envelope.is_success());
        assert_eq!(envelope.data.unwrap()[0]["id"], 1);
        assert!(envelope.meta.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_identical_reads_share_one_send() {
        let (client, transport) = client(vec![Script::Respond(200, r#"[{"id": 1}]"#)]);

        let a = client.select("/rest/v1/workouts", &[]);
        let b = client.select("/rest/v1/workouts", &[]);
        let (ra, rb) = tokio::join!(a, b);

        assert_eq!(transport.sends(), 1);
        assert!(ra.is_success());
        assert!(rb.is_success());
        // One of the two was served from the shared in-flight call
        let cached_count = [ra, rb]
            .iter()
            .filter(|e| e.meta.as_ref().is_some_and(|m| m.cached))
            .count();
        assert_eq!(cached_count, 1);
    }

    #[tokio::test]
    async fn test_mutations_are_not_deduplicated() {
        let (client, transport) = client(vec![
            Script::Respond(201, "{}"),
            Script::Respond(201, "{}"),
        ]);

        let a = client.insert("/rest/v1/meals", json!({"title": "lunch"}));
        let b = client.insert("/rest/v1/meals", json!({"title": "lunch"}));
        let (ra, rb) = tokio::join!(a, b);

        assert_eq!(transport.sends(), 2);
        assert!(ra.is_success());
        assert!(rb.is_success());
    }

    #[tokio::test]
    async fn test_terminal_transient_failure_parks_mutation() {
        let (client, transport) = client(vec![
            Script::ConnectError,
            Script::ConnectError,
            Script::ConnectError,
        ]);

        let op = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"title": "lunch"}),
        );
        let outcome = client.mutate_or_queue(op, Some("user-1")).await;

        assert_eq!(transport.sends(), 3);
        match outcome {
            MutationOutcome::Queued { error, .. } => {
                assert_eq!(error.kind, ErrorKind::Network);
            }
            other => panic!("expected queued outcome, got {other:?}"),
        }
        assert_eq!(client.offline_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_queued() {
        let (client, _) = client(vec![Script::Respond(422, r#"{"message": "bad row"}"#)]);

        let op = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"title": ""}),
        );
        let outcome = client.mutate_or_queue(op, None).await;

        assert!(matches!(outcome, MutationOutcome::Failed(_)));
        assert!(client.offline_queue().is_empty());
    }

    #[tokio::test]
    async fn test_offline_mutation_queues_without_a_send() {
        let (client, transport) = client(vec![]);
        client.connectivity().set_online(false);

        let op = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"title": "lunch"}),
        );
        let outcome = client.mutate_or_queue(op, None).await;

        assert_eq!(transport.sends(), 0);
        assert!(matches!(outcome, MutationOutcome::Queued { .. }));
    }

    #[tokio::test]
    async fn test_sync_offline_replays_parked_mutations() {
        let (client, transport) = client(vec![
            Script::ConnectError,
            Script::ConnectError,
            Script::ConnectError,
            Script::Respond(201, "{}"),
        ]);

        let op = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"title": "lunch"}),
        );
        client.mutate_or_queue(op, Some("user-1")).await;
        assert_eq!(client.offline_queue().len(), 1);

        let report = client.sync_offline(Some("user-1")).await;
        assert_eq!(report.replayed, 1);
        assert!(client.offline_queue().is_empty());
        assert_eq!(transport.sends(), 4);
    }

    #[tokio::test]
    async fn test_rate_limited_call_surfaces_typed_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let mut config = SyncClientConfig::new("https://store.example.com", "anon-key");
        config.executor = fast_config();
        config.rate_limits = RateLimitConfig::default().with_rule(
            "records.read",
            crate::rate_limit::RateLimitRule::new(0, Duration::from_secs(60)),
        );
        let client = SyncClient::with_transport(
            config,
            transport.clone(),
            Arc::new(StaticTokenProvider::new("user-token")),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let envelope = client.select("/rest/v1/workouts", &[]).await;
        assert!(!envelope.is_success());
        assert_eq!(transport.sends(), 0);
        let error = envelope.error.unwrap();
        assert!(error.retry_after.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_trigger_replays_queue() {
        let (client, transport) = client(vec![
            Script::ConnectError,
            Script::ConnectError,
            Script::ConnectError,
            Script::Respond(201, "{}"),
        ]);

        let op = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"title": "lunch"}),
        );
        client.mutate_or_queue(op, None).await;

        let handle = client.clone().spawn_reconnect_sync();
        client.connectivity().set_online(false);
        client.connectivity().set_online(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(client.offline_queue().is_empty());
        assert_eq!(transport.sends(), 4);
        handle.abort();
    }
}
