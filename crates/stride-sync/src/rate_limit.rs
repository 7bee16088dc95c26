//! Per-operation sliding-window rate limiting
//!
//! Each named operation gets a trailing window of request timestamps bounding
//! how many calls may proceed. Windows persist through the key-value store so
//! a process restart cannot reset them; timestamps older than the window are
//! pruned lazily on each check. Overflow calls either queue (bounded, polled
//! at the backoff cadence) or fail immediately with a retry-after hint.

use crate::backoff::BackoffPolicy;
use crate::error::{Result, SyncError};
use crate::storage::KeyValueStore;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Limit for one named operation
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    /// Maximum requests inside any trailing window
    pub max_requests: u32,
    /// Window duration
    pub window: Duration,
    /// Whether overflow calls may wait for a slot
    pub queue_overflow: bool,
    /// Maximum number of waiting callers
    pub max_queue: usize,
}

impl RateLimitRule {
    /// Create a rule that rejects overflow immediately
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            queue_overflow: false,
            max_queue: 10,
        }
    }

    /// Allow overflow calls to queue for a freed slot
    pub fn queued(mut self) -> Self {
        self.queue_overflow = true;
        self
    }

    /// Bound the waiting queue
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }
}

/// Closed table of per-operation rules plus a fallback bucket
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    rules: HashMap<String, RateLimitRule>,
    fallback: RateLimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let mut rules = HashMap::new();
        // AI operations are expensive upstream, keep them scarce but queued
        rules.insert(
            "ai.analyze".to_string(),
            RateLimitRule::new(5, minute).queued(),
        );
        rules.insert(
            "ai.plan".to_string(),
            RateLimitRule::new(10, minute).queued(),
        );
        rules.insert("records.read".to_string(), RateLimitRule::new(100, minute));
        rules.insert("media.upload".to_string(), RateLimitRule::new(20, minute));
        rules.insert(
            "media.upload_large".to_string(),
            RateLimitRule::new(5, minute),
        );

        Self {
            rules,
            fallback: RateLimitRule::new(30, minute),
        }
    }
}

impl RateLimitConfig {
    /// Override or add a rule
    pub fn with_rule(mut self, operation: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(operation.into(), rule);
        self
    }

    /// Replace the fallback bucket
    pub fn with_fallback(mut self, rule: RateLimitRule) -> Self {
        self.fallback = rule;
        self
    }

    /// The rule governing an operation name
    pub fn rule_for(&self, operation: &str) -> &RateLimitRule {
        self.rules.get(operation).unwrap_or(&self.fallback)
    }
}

/// Snapshot returned by [`RateLimiter::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Whether a call may proceed right now
    pub allowed: bool,
    /// Slots left in the current window
    pub remaining: u32,
    /// Time until the oldest timestamp ages out
    pub reset_in: Duration,
}

/// Sliding-window rate limiter with persisted windows
pub struct RateLimiter {
    config: RateLimitConfig,
    storage: Arc<dyn KeyValueStore>,
    windows: Mutex<HashMap<String, Vec<i64>>>,
    waiting: Mutex<HashMap<String, usize>>,
    poll_backoff: BackoffPolicy,
}

/// Releases a waiting-queue slot when a queued caller leaves, admitted or not
struct QueueSlot<'a> {
    limiter: &'a RateLimiter,
    operation: String,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut waiting) = self.limiter.waiting.lock() {
            if let Some(count) = waiting.get_mut(&self.operation) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl RateLimiter {
    /// Create a limiter over the given config and storage
    pub fn new(config: RateLimitConfig, storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            storage,
            windows: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            poll_backoff: BackoffPolicy::default(),
        }
    }

    /// Override the queue polling cadence
    pub fn with_poll_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.poll_backoff = backoff;
        self
    }

    fn storage_key(operation: &str) -> String {
        format!("ratelimit:{operation}")
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Load the window for an operation into the cache, reading persisted
    /// state on first touch
    fn window_mut<'a>(
        windows: &'a mut HashMap<String, Vec<i64>>,
        storage: &dyn KeyValueStore,
        operation: &str,
    ) -> &'a mut Vec<i64> {
        windows.entry(operation.to_string()).or_insert_with(|| {
            storage
                .get(&Self::storage_key(operation))
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default()
        })
    }

    fn prune(timestamps: &mut Vec<i64>, window: Duration, now: i64) {
        let cutoff = now - window.as_millis() as i64;
        timestamps.retain(|&t| t > cutoff);
    }

    fn status_of(timestamps: &[i64], rule: &RateLimitRule, now: i64) -> RateLimitStatus {
        let count = timestamps.len() as u32;
        let allowed = count < rule.max_requests;
        let remaining = rule.max_requests.saturating_sub(count);
        let reset_in = if allowed {
            Duration::ZERO
        } else {
            timestamps
                .first()
                .map(|&oldest| {
                    let expires_at = oldest + rule.window.as_millis() as i64;
                    Duration::from_millis(expires_at.saturating_sub(now).max(0) as u64)
                })
                .unwrap_or(Duration::ZERO)
        };
        RateLimitStatus {
            allowed,
            remaining,
            reset_in,
        }
    }

    /// Inspect the window without consuming a slot
    pub fn check(&self, operation: &str) -> RateLimitStatus {
        let rule = self.config.rule_for(operation);
        let now = Self::now_ms();
        let Ok(mut windows) = self.windows.lock() else {
            return RateLimitStatus {
                allowed: true,
                remaining: rule.max_requests,
                reset_in: Duration::ZERO,
            };
        };
        let timestamps = Self::window_mut(&mut windows, self.storage.as_ref(), operation);
        Self::prune(timestamps, rule.window, now);
        Self::status_of(timestamps, rule, now)
    }

    /// Record a request now, persisting the window immediately
    pub fn consume(&self, operation: &str) {
        let rule = self.config.rule_for(operation);
        let now = Self::now_ms();
        if let Ok(mut windows) = self.windows.lock() {
            let timestamps = Self::window_mut(&mut windows, self.storage.as_ref(), operation);
            Self::prune(timestamps, rule.window, now);
            timestamps.push(now);
            self.persist(operation, timestamps);
        }
    }

    /// Atomically check and consume one slot
    fn try_admit(&self, operation: &str) -> std::result::Result<(), Duration> {
        let rule = self.config.rule_for(operation);
        let now = Self::now_ms();
        let Ok(mut windows) = self.windows.lock() else {
            // Degraded limiter admits rather than deadlocks
            return Ok(());
        };
        let timestamps = Self::window_mut(&mut windows, self.storage.as_ref(), operation);
        Self::prune(timestamps, rule.window, now);
        let status = Self::status_of(timestamps, rule, now);
        if status.allowed {
            timestamps.push(now);
            self.persist(operation, timestamps);
            Ok(())
        } else {
            Err(status.reset_in)
        }
    }

    fn persist(&self, operation: &str, timestamps: &[i64]) {
        if let Ok(raw) = serde_json::to_string(timestamps) {
            self.storage.set(&Self::storage_key(operation), &raw);
        }
    }

    /// Try to join the bounded waiting queue for an operation
    fn enter_queue(&self, operation: &str) -> Option<QueueSlot<'_>> {
        let rule = self.config.rule_for(operation);
        let mut waiting = self.waiting.lock().ok()?;
        let count = waiting.entry(operation.to_string()).or_insert(0);
        if *count >= rule.max_queue {
            return None;
        }
        *count += 1;
        Some(QueueSlot {
            limiter: self,
            operation: operation.to_string(),
        })
    }

    /// Admit-or-queue wrapper around one call
    ///
    /// Allowed calls consume a slot and run immediately. Overflow calls
    /// queue when the rule permits and the queue has room, polling at the
    /// backoff cadence until a slot frees; otherwise the call fails with a
    /// rate-limit error carrying a retry-after hint.
    pub async fn with_limit<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let reset_in = match self.try_admit(operation) {
            Ok(()) => return f().await,
            Err(reset_in) => reset_in,
        };

        let rule = self.config.rule_for(operation);
        if !rule.queue_overflow {
            return Err(Self::rejection(reset_in));
        }
        let Some(_slot) = self.enter_queue(operation) else {
            return Err(Self::rejection(reset_in));
        };

        log::debug!("{operation} rate limited, queued for a free slot");
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(self.poll_backoff.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
            if self.try_admit(operation).is_ok() {
                return f().await;
            }
        }
    }

    fn rejection(reset_in: Duration) -> SyncError {
        let hint_secs = (reset_in.as_millis() as u64).div_ceil(1000);
        SyncError::rate_limited(hint_secs)
    }
}
