//! Per-scope request rate limiting.
//!
//! Fixed-window counters keyed by (scope, tenant[, sub-scope]). The
//! counter store is pluggable: the in-memory implementation covers
//! single-process deployments; a shared store slots in behind the same
//! trait for multi-process ones. Exceeding the limit surfaces the
//! limiter's configured error body and mutates nothing else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Window configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Requests allowed per window
    pub limit: u64,

    pub window_seconds: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window_seconds: 60,
        }
    }
}

/// Counter backing. `increment` returns the count for (key, bucket)
/// after adding this request.
pub trait CounterStore: Send + Sync {
    fn increment(&self, key: &str, bucket: i64) -> u64;
}

/// In-memory counters. Each key holds only its current bucket, so stale
/// windows are dropped on rollover.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (i64, u64)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment(&self, key: &str, bucket: i64) -> u64 {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        let entry = counters.entry(key.to_string()).or_insert((bucket, 0));
        if entry.0 != bucket {
            *entry = (bucket, 0);
        }
        entry.1 += 1;
        entry.1
    }
}

/// A scoped fixed-window limiter.
pub struct RateLimiter {
    scope: String,
    config: BucketConfig,
    store: Arc<dyn CounterStore>,
    error_body: serde_json::Value,
}

impl RateLimiter {
    pub fn new(scope: impl Into<String>, config: BucketConfig, store: Arc<dyn CounterStore>) -> Self {
        let scope = scope.into();
        let error_body = serde_json::json!({
            "error": "rate_limited",
            "scope": scope,
        });
        Self {
            scope,
            config,
            store,
            error_body,
        }
    }

    /// Override the body returned to rate-limited callers.
    pub fn with_error_body(mut self, body: serde_json::Value) -> Self {
        self.error_body = body;
        self
    }

    /// Count this request against (scope, key_parts). Returns true when the
    /// request must be blocked.
    pub fn check(&self, key_parts: &[&str]) -> bool {
        let window = self.config.window_seconds.max(1) as i64;
        self.check_at(key_parts, Utc::now().timestamp() / window)
    }

    fn check_at(&self, key_parts: &[&str], bucket: i64) -> bool {
        let mut key = self.scope.clone();
        for part in key_parts {
            key.push(':');
            key.push_str(part);
        }
        let count = self.store.increment(&key, bucket);
        count > self.config.limit
    }

    pub fn error_body(&self) -> &serde_json::Value {
        &self.error_body
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(
            "commands",
            BucketConfig {
                limit,
                window_seconds: 60,
            },
            Arc::new(MemoryCounterStore::new()),
        )
    }

    #[test]
    fn test_blocks_after_limit() {
        let limiter = limiter(3);
        for _ in 0..3 {
            assert!(!limiter.check_at(&["org-1"], 0));
        }
        assert!(limiter.check_at(&["org-1"], 0));
        assert!(limiter.check_at(&["org-1"], 0));
    }

    #[test]
    fn test_tenants_are_independent() {
        let limiter = limiter(1);
        assert!(!limiter.check_at(&["org-1"], 0));
        assert!(!limiter.check_at(&["org-2"], 0));
        assert!(limiter.check_at(&["org-1"], 0));
    }

    #[test]
    fn test_window_rollover_resets() {
        let limiter = limiter(1);
        assert!(!limiter.check_at(&["org-1"], 0));
        assert!(limiter.check_at(&["org-1"], 0));
        // Next window
        assert!(!limiter.check_at(&["org-1"], 1));
    }

    #[test]
    fn test_sub_scope_keys() {
        let limiter = limiter(1);
        assert!(!limiter.check_at(&["org-1", "director"], 0));
        assert!(!limiter.check_at(&["org-1", "domain"], 0));
        assert!(limiter.check_at(&["org-1", "director"], 0));
    }

    #[test]
    fn test_error_body_override() {
        let limiter = limiter(1).with_error_body(serde_json::json!({
            "error": "slow_down",
            "retry_after_seconds": 60,
        }));
        assert_eq!(
            limiter.error_body().get("error").and_then(|v| v.as_str()),
            Some("slow_down")
        );
    }
}
