//! Request executor with deadline, retry, and error classification
//!
//! One [`RequestExecutor::execute`] call performs a single logical operation:
//! it bounds every attempt by the operation's deadline, classifies failures,
//! retries retryable ones per the backoff policy, and always resolves to a
//! typed result. Terminal auth failures additionally raise one
//! [`AuthEvent`] per cooldown window so the auth collaborator can refresh
//! the session without being stormed by concurrent failures.

use crate::auth::AuthEvent;
use crate::backoff::BackoffPolicy;
use crate::diagnostics::{AttemptOutcome, AttemptRecord, RequestLog};
use crate::error::{ErrorKind, Result, SyncError};
use crate::operation::Operation;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Response surfaced by a transport, before classification
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// Parsed Retry-After header, in seconds
    pub retry_after: Option<u64>,
    /// Response body text
    pub body: String,
}

/// Failure below the HTTP layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No response reached us
    #[error("connection failed: {0}")]
    Connect(String),
    /// Anything else the transport could not attribute
    #[error("transport failure: {0}")]
    Other(String),
}

/// Seam between the executor and the wire
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request and surface the raw outcome
    async fn send(&self, request: reqwest::Request)
        -> std::result::Result<RawResponse, TransportError>;
}

/// Production transport over a shared `reqwest::Client`
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with its own connection pool
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: reqwest::Request,
    ) -> std::result::Result<RawResponse, TransportError> {
        let response = self.client.execute(request).await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum attempts per logical call
    pub max_attempts: u32,
    /// Delay policy between retryable attempts
    pub backoff: BackoffPolicy,
    /// Minimum spacing between auth-refresh notifications
    pub auth_cooldown: Duration,
    /// Record attempts in the diagnostics ring buffer
    pub log_requests: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            auth_cooldown: Duration::from_secs(5),
            log_requests: false,
        }
    }
}

/// Executes one logical operation with retries
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    config: ExecutorConfig,
    auth_events: broadcast::Sender<AuthEvent>,
    last_auth_notice: Mutex<Option<Instant>>,
    log: Arc<RequestLog>,
}

impl RequestExecutor {
    /// Create an executor over the given transport
    pub fn new(transport: Arc<dyn Transport>, config: ExecutorConfig) -> Self {
        let (auth_events, _) = broadcast::channel(8);
        Self {
            transport,
            config,
            auth_events,
            last_auth_notice: Mutex::new(None),
            log: Arc::new(RequestLog::default()),
        }
    }

    /// Register an observer for auth-refresh notifications
    pub fn subscribe_auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }

    /// The diagnostics ring buffer fed by this executor
    pub fn request_log(&self) -> Arc<RequestLog> {
        self.log.clone()
    }

    /// Perform `op`, retrying retryable failures up to the configured max
    ///
    /// `build_request` runs once per attempt so each retry sees current
    /// credentials. Non-retryable errors propagate on first occurrence;
    /// exhausted retries return the last classified error.
    pub async fn execute<F, Fut>(&self, op: &Operation, build_request: F) -> Result<Value>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::Request>>,
    {
        let mut last_error = SyncError::new(ErrorKind::Unknown, "no attempts were made");

        for attempt in 0..self.config.max_attempts {
            let started = Instant::now();
            let outcome = self.attempt(op, &build_request).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok((value, status)) => {
                    self.record(op, attempt, duration_ms, AttemptOutcome::Success(status));
                    log::debug!(
                        "{} {} -> {status} (attempt {attempt}, {duration_ms}ms)",
                        op.method,
                        op.path
                    );
                    return Ok(value);
                }
                Err(error) => {
                    self.record(op, attempt, duration_ms, AttemptOutcome::Failure(error.kind));

                    let retryable = error.should_retry();
                    if retryable && attempt + 1 < self.config.max_attempts {
                        let delay = error
                            .retry_after
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| self.config.backoff.delay(attempt));
                        log::warn!(
                            "{} failed (attempt {attempt}), retrying after {delay:?}: {error}",
                            op.name
                        );
                        last_error = error;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    log::warn!("{} failed terminally after attempt {attempt}: {error}", op.name);
                    if error.kind == ErrorKind::Auth {
                        self.notify_auth_failure();
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error)
    }

    async fn attempt<F, Fut>(&self, op: &Operation, build_request: &F) -> Result<(Value, u16)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::Request>>,
    {
        let request = build_request().await?;

        let raw = match tokio::time::timeout(op.timeout, self.transport.send(request)).await {
            Err(_) => return Err(SyncError::timeout(&op.name, op.timeout.as_secs())),
            Ok(Err(TransportError::Connect(message))) => return Err(SyncError::network(message)),
            Ok(Err(TransportError::Other(message))) => {
                return Err(SyncError::new(ErrorKind::Unknown, message))
            }
            Ok(Ok(raw)) => raw,
        };

        if !(200..300).contains(&raw.status) {
            return Err(SyncError::from_status(raw.status, raw.retry_after, &raw.body));
        }

        // Empty and no-content responses are valid null payloads
        if raw.status == 204 || raw.body.trim().is_empty() {
            return Ok((Value::Null, raw.status));
        }

        let value = serde_json::from_str(&raw.body).map_err(|e| {
            SyncError::new(
                ErrorKind::Validation,
                format!("failed to parse response body: {e}"),
            )
        })?;
        Ok((value, raw.status))
    }

    /// Emit at most one refresh notification per cooldown window
    fn notify_auth_failure(&self) {
        let Ok(mut last) = self.last_auth_notice.lock() else {
            return;
        };
        let now = Instant::now();
        let due = last
            .map(|t| now.duration_since(t) >= self.config.auth_cooldown)
            .unwrap_or(true);
        if due {
            *last = Some(now);
            let _ = self.auth_events.send(AuthEvent::RefreshNeeded);
        }
    }

    fn record(&self, op: &Operation, attempt: u32, duration_ms: u64, outcome: AttemptOutcome) {
        if !self.config.log_requests {
            return;
        }
        self.log.record(AttemptRecord {
            operation: op.name.clone(),
            method: op.method.to_string(),
            path: op.path.clone(),
            attempt,
            duration_ms,
            outcome,
            at: chrono::Utc::now(),
        });
    }
}
