//! Operation descriptors and request construction
//!
//! An [`Operation`] is the immutable description of one logical call against
//! the remote store: method, resource path, optional body, deadline, and the
//! name the rate limiter buckets it under. [`RequestFactory`] turns a
//! descriptor into a concrete `reqwest::Request` with the store's required
//! headers.

use crate::error::{ErrorKind, Result, SyncError};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub use reqwest::Method;

/// Broad operation class, used only for default deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Plain reads
    Read,
    /// Row mutations
    Write,
    /// Media uploads
    Upload,
    /// Remote procedure calls
    Rpc,
}

impl OperationClass {
    /// Default deadline for this class of call
    pub fn default_timeout(&self) -> Duration {
        match self {
            OperationClass::Read => Duration::from_secs(20),
            OperationClass::Write => Duration::from_secs(25),
            OperationClass::Upload => Duration::from_secs(60),
            OperationClass::Rpc => Duration::from_secs(30),
        }
    }
}

/// Representation preference sent to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefer {
    /// Echo the affected row(s) back
    Representation,
    /// Return nothing
    Minimal,
    /// Upsert variant: merge on conflict against the given target columns
    Merge {
        /// Comma-separated conflict target columns
        on_conflict: String,
    },
}

impl Prefer {
    /// Header value for the `Prefer` header
    pub fn header_value(&self) -> &'static str {
        match self {
            Prefer::Representation => "return=representation",
            Prefer::Minimal => "return=minimal",
            Prefer::Merge { .. } => "return=representation,resolution=merge-duplicates",
        }
    }
}

/// Immutable description of one logical network call
#[derive(Debug, Clone)]
pub struct Operation {
    /// Rate-limiting bucket name, e.g. `records.read`
    pub name: String,
    /// HTTP method
    pub method: Method,
    /// Resource path relative to the store base URL
    pub path: String,
    /// Query-style filters
    pub query: Vec<(String, String)>,
    /// JSON body for mutations
    pub body: Option<Value>,
    /// Deadline for each attempt
    pub timeout: Duration,
    /// Representation preference
    pub prefer: Prefer,
}

impl Operation {
    /// A read against a resource path
    pub fn read(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: OperationClass::Read.default_timeout(),
            prefer: Prefer::Representation,
        }
    }

    /// A mutation with an explicit method
    pub fn write(
        name: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
            timeout: OperationClass::Write.default_timeout(),
            prefer: Prefer::Representation,
        }
    }

    /// A media upload
    pub fn upload(name: impl Into<String>, path: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
            timeout: OperationClass::Upload.default_timeout(),
            prefer: Prefer::Minimal,
        }
    }

    /// A remote procedure call
    pub fn rpc(name: impl Into<String>, path: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(args),
            timeout: OperationClass::Rpc.default_timeout(),
            prefer: Prefer::Minimal,
        }
    }

    /// Override the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a query filter
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set the representation preference
    pub fn with_prefer(mut self, prefer: Prefer) -> Self {
        self.prefer = prefer;
        self
    }

    /// Whether this operation mutates remote state
    pub fn is_mutation(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }

    /// Fingerprint of method + path + query + body for deduplication
    ///
    /// `serde_json::Value` objects serialize with sorted keys, so two bodies
    /// with the same fields always produce the same key.
    pub fn dedupe_key(&self) -> String {
        let mut key = format!("{} {}", self.method, self.path);
        for (name, value) in &self.query {
            key.push_str(&format!("&{name}={value}"));
        }
        if let Some(body) = &self.body {
            key.push(' ');
            key.push_str(&body.to_string());
        }
        key
    }
}

/// Builds concrete requests for a given store endpoint
#[derive(Debug, Clone)]
pub struct RequestFactory {
    base_url: Url,
    api_key: String,
}

impl RequestFactory {
    /// Create a factory for the given base URL and API key
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            SyncError::new(
                ErrorKind::Validation,
                format!("invalid base URL {base_url}: {e}"),
            )
        })?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Build a request for the operation, attaching the required headers
    ///
    /// The bearer token falls back to the API key for anonymous sessions,
    /// matching what the store expects for unauthenticated reads.
    pub fn build(&self, op: &Operation, bearer: Option<&str>) -> Result<reqwest::Request> {
        let url = self.base_url.join(&op.path).map_err(|e| {
            SyncError::new(
                ErrorKind::Validation,
                format!("failed to join path {}: {e}", op.path),
            )
        })?;

        let token = bearer.unwrap_or(&self.api_key);
        let mut builder = reqwest::Client::new()
            .request(op.method.clone(), url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json");

        if op.is_mutation() {
            builder = builder.header("Prefer", op.prefer.header_value());
            if let Prefer::Merge { on_conflict } = &op.prefer {
                builder = builder.query(&[("on_conflict", on_conflict.as_str())]);
            }
        }

        if !op.query.is_empty() {
            builder = builder.query(&op.query);
        }

        if let Some(body) = &op.body {
            builder = builder.json(body);
        }

        builder.build().map_err(|e| {
            SyncError::new(
                ErrorKind::Validation,
                format!("failed to build request: {e}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_class_default_timeouts() {
        assert_eq!(
            OperationClass::Read.default_timeout(),
            Duration::from_secs(20)
        );
        assert_eq!(
            OperationClass::Write.default_timeout(),
            Duration::from_secs(25)
        );
        assert_eq!(
            OperationClass::Upload.default_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(
            OperationClass::Rpc.default_timeout(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_constructors_apply_class_defaults() {
        let read = Operation::read("records.read", "/rest/v1/workouts");
        assert_eq!(read.method, Method::GET);
        assert_eq!(read.timeout, Duration::from_secs(20));

        let rpc = Operation::rpc("ai.analyze", "/rest/v1/rpc/analyze_meal", json!({}));
        assert_eq!(rpc.timeout, Duration::from_secs(30));

        let upload = Operation::upload("media.upload", "/storage/v1/photos", json!({}));
        assert_eq!(upload.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_dedupe_key_includes_method_path_query_body() {
        let a = Operation::read("records.read", "/rest/v1/workouts")
            .with_query("user_id", "eq.7");
        let b = Operation::read("records.read", "/rest/v1/workouts")
            .with_query("user_id", "eq.7");
        let c = Operation::read("records.read", "/rest/v1/workouts")
            .with_query("user_id", "eq.8");
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        assert_ne!(a.dedupe_key(), c.dedupe_key());
    }

    #[test]
    fn test_dedupe_key_is_stable_across_body_key_order() {
        let a = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"title": "lunch", "calories": 600}),
        );
        let b = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/meals",
            json!({"calories": 600, "title": "lunch"}),
        );
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }

    #[test]
    fn test_build_request_headers_and_url() {
        let factory = RequestFactory::new("https://store.example.com", "anon-key").unwrap();
        let op = Operation::read("records.read", "/rest/v1/workouts").with_query("select", "*");

        let request = factory.build(&op, Some("user-token")).unwrap();
        assert_eq!(request.method(), &Method::GET);
        assert!(request
            .url()
            .as_str()
            .starts_with("https://store.example.com/rest/v1/workouts"));
        assert_eq!(request.headers()["apikey"], "anon-key");
        assert_eq!(request.headers()["Authorization"], "Bearer user-token");
    }

    #[test]
    fn test_bearer_falls_back_to_api_key() {
        let factory = RequestFactory::new("https://store.example.com", "anon-key").unwrap();
        let op = Operation::read("records.read", "/rest/v1/plans");
        let request = factory.build(&op, None).unwrap();
        assert_eq!(request.headers()["Authorization"], "Bearer anon-key");
    }

    #[test]
    fn test_upsert_adds_merge_header_and_conflict_target() {
        let factory = RequestFactory::new("https://store.example.com", "anon-key").unwrap();
        let op = Operation::write(
            "records.write",
            Method::POST,
            "/rest/v1/progress",
            json!({"day": 2, "completed": true}),
        )
        .with_prefer(Prefer::Merge {
            on_conflict: "user_id,day".to_string(),
        });

        let request = factory.build(&op, None).unwrap();
        assert_eq!(
            request.headers()["Prefer"],
            "return=representation,resolution=merge-duplicates"
        );
        assert!(request
            .url()
            .query()
            .unwrap()
            .contains("on_conflict=user_id%2Cday"));
    }

    #[test]
    fn test_reads_do_not_send_prefer() {
        let factory = RequestFactory::new("https://store.example.com", "anon-key").unwrap();
        let op = Operation::read("records.read", "/rest/v1/workouts");
        let request = factory.build(&op, None).unwrap();
        assert!(request.headers().get("Prefer").is_none());
    }

    #[test]
    fn test_invalid_base_url_is_a_validation_error() {
        let err = RequestFactory::new("not a url", "key").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
    }
}
