//! Standard response envelope
//!
//! Every high-level client call resolves to an [`Envelope`]: either `data`
//! or `error` is populated, with optional call metadata alongside.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata attached to a settled call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// When the call settled
    pub timestamp: DateTime<Utc>,
    /// Wall time from admission to settlement
    pub duration_ms: u64,
    /// Whether the result was served from a deduplicated in-flight call
    pub cached: bool,
}

impl EnvelopeMeta {
    /// Metadata for a call that settled just now
    pub fn now(duration_ms: u64, cached: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            duration_ms,
            cached,
        }
    }
}

/// Uniform `{data, error}` envelope produced by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload on success; `Value::Null` for empty/no-content responses
    pub data: Option<Value>,
    /// Classified error on failure
    pub error: Option<SyncError>,
    /// Optional call metadata
    pub meta: Option<EnvelopeMeta>,
}

impl Envelope {
    /// Successful envelope
    pub fn success(data: Value, meta: Option<EnvelopeMeta>) -> Self {
        Self {
            data: Some(data),
            error: None,
            meta,
        }
    }

    /// Failed envelope
    pub fn failure(error: SyncError, meta: Option<EnvelopeMeta>) -> Self {
        Self {
            data: None,
            error: Some(error),
            meta,
        }
    }

    /// Build from an executor result
    pub fn from_result(result: Result<Value, SyncError>, meta: Option<EnvelopeMeta>) -> Self {
        match result {
            Ok(data) => Self::success(data, meta),
            Err(error) => Self::failure(error, meta),
        }
    }

    /// Whether the call succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert back into a `Result`, consuming the envelope
    pub fn into_result(self) -> Result<Value, SyncError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}
