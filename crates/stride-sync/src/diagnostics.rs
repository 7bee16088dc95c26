//! Request diagnostics
//!
//! Development-mode log of individual request attempts, kept in a bounded
//! in-memory ring buffer so the newest records survive and nothing grows
//! without limit.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Response accepted with this status
    Success(u16),
    /// Attempt failed with this classification
    Failure(ErrorKind),
}

/// One recorded attempt
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Rate-limit operation name
    pub operation: String,
    /// HTTP method as sent
    pub method: String,
    /// Resource path
    pub path: String,
    /// Zero-based attempt index within the executor loop
    pub attempt: u32,
    /// Attempt wall time
    pub duration_ms: u64,
    /// How the attempt ended
    pub outcome: AttemptOutcome,
    /// When the attempt settled
    pub at: DateTime<Utc>,
}

/// Bounded ring buffer of attempt records
#[derive(Debug)]
pub struct RequestLog {
    capacity: usize,
    records: Mutex<VecDeque<AttemptRecord>>,
}

impl RequestLog {
    /// Create a log retaining at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, record: AttemptRecord) {
        if let Ok(mut records) = self.records.lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    /// The most recent `n` records, newest last
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        match self.records.lock() {
            Ok(records) => records.iter().rev().take(n).rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of retained records
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records
    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(operation: &str, attempt: u32) -> AttemptRecord {
        AttemptRecord {
            operation: operation.to_string(),
            method: "GET".to_string(),
            path: "/rest/v1/workouts".to_string(),
            attempt,
            duration_ms: 42,
            outcome: AttemptOutcome::Success(200),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let log = RequestLog::new(3);
        for i in 0..5 {
            log.record(record("records.read", i));
        }
        assert_eq!(log.len(), 3);

        let recent = log.recent(10);
        let attempts: Vec<u32> = recent.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![2, 3, 4]);
    }

    #[test]
    fn test_recent_returns_newest_last() {
        let log = RequestLog::new(10);
        log.record(record("a", 0));
        log.record(record("b", 1));

        let recent = log.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].attempt, 1);
    }

    #[test]
    fn test_clear() {
        let log = RequestLog::default();
        log.record(record("records.read", 0));
        assert!(!log.is_empty());
        log.clear();
        assert!(log.is_empty());
    }
}
