//! Error classification for the sync layer
//!
//! Normalizes transport failures and remote store responses into a uniform
//! error shape whose `retryable` flag drives every retry decision in this
//! crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Classification of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection-level failure, no response reached us - retry
    Network,
    /// Deadline exceeded - retry
    Timeout,
    /// 401/403 - do not retry, refresh credentials instead
    Auth,
    /// 404 - do not retry
    NotFound,
    /// 409 - do not retry
    Conflict,
    /// 400/422 - do not retry
    Validation,
    /// 5xx (and 429, which carries a Retry-After hint) - retry
    ServerError,
    /// Anything else - conservative default, do not retry
    Unknown,
}

impl ErrorKind {
    /// Check if this error kind should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError
        )
    }
}

/// Normalized error produced once per failed attempt
///
/// `Clone + Serialize` so the same settled error can be fanned out to every
/// caller attached to a deduplicated request and persisted alongside queued
/// mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    /// Error classification for retry logic
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code if a response was received
    pub status: Option<u16>,
    /// Whether the executor may retry this attempt
    pub retryable: bool,
    /// Suggested wait before retrying, in seconds
    pub retry_after: Option<u64>,
    /// Machine-readable details parsed from the response body
    pub details: Option<Value>,
}

impl SyncError {
    /// Create an error of the given kind; `retryable` follows the kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retryable: kind.is_retryable(),
            retry_after: None,
            details: None,
        }
    }

    /// Connection-level failure before any response arrived
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Deadline exceeded for the named operation
    pub fn timeout(operation: &str, deadline_secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{operation} timed out after {deadline_secs}s"),
        )
    }

    /// Local rate-limit rejection carrying a retry-after hint
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        let mut err = Self::new(
            ErrorKind::ServerError,
            format!("rate limit exceeded, retry after {retry_after_secs}s"),
        );
        err.retry_after = Some(retry_after_secs);
        err
    }

    /// Classify a response status code, parsing the body best-effort
    ///
    /// Total: every status maps to some kind, unparseable bodies fall back
    /// to the raw text.
    pub fn from_status(status: u16, retry_after: Option<u64>, body: &str) -> Self {
        let kind = classify_status(status);
        let details = serde_json::from_str::<Value>(body).ok();
        let message = extract_message(&details, body)
            .unwrap_or_else(|| format!("request failed with status {status}"));

        Self {
            kind,
            message,
            status: Some(status),
            retryable: kind.is_retryable(),
            retry_after,
            details,
        }
    }

    /// Check if this error should trigger a retry
    pub fn should_retry(&self) -> bool {
        self.retryable
    }
}

/// Map a status code to an error kind
///
/// 429 folds into `ServerError`: retryable, with the Retry-After value
/// carried separately on the error.
fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        400 | 422 => ErrorKind::Validation,
        429 => ErrorKind::ServerError,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    }
}

/// Pull a human message out of common store error body shapes
fn extract_message(details: &Option<Value>, body: &str) -> Option<String> {
    if let Some(json) = details {
        // {"error": {"message": "..."}}
        if let Some(message) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Some(message.to_string());
        }
        // {"message": "...", "hint": ...}
        if let Some(message) = json.get("message").and_then(|m| m.as_str()) {
            return Some(message.to_string());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sync error [{}]: {} (kind: {:?})",
            self.status
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.message,
            self.kind
        )
    }
}

impl std::error::Error for SyncError {}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::new(
            ErrorKind::Validation,
            format!("payload serialization failed: {err}"),
        )
    }
}

/// Convenience type alias for Results using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
