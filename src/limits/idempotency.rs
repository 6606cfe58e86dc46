//! Idempotent result caching.
//!
//! Logically identical operations are identified by a deterministic key
//! hashed from `{agent, template, arguments}`. Only successful, unexpired
//! records are ever replayed; failures always re-execute.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Default record time-to-live (1 hour).
const DEFAULT_TTL_SECS: u64 = 3600;

/// Hex length of a key: first 16 chars of the SHA-256 digest.
const KEY_HEX_LEN: usize = 16;

/// Compute the idempotency key for an operation.
///
/// The key hashes canonical JSON of `{agent, template, arguments}`.
/// `serde_json` maps are ordered by key (the `preserve_order` feature is
/// not enabled), so the serialization is stable under argument reordering.
pub fn idempotency_key(agent: &str, template: &str, arguments: &Value) -> String {
    let canonical = serde_json::json!({
        "agent": agent,
        "arguments": arguments,
        "template": template,
    });
    let hash = digest(&SHA256, canonical.to_string().as_bytes());
    hash.as_ref()[..KEY_HEX_LEN / 2]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Terminal status of a recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// One cached operation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RecordStatus,
}

impl IdempotencyRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// TTL'd key → result store behind one coarse mutex.
///
/// Constructed explicitly and shared by `Arc` between the components that
/// need cross-call dedup. Expired and failed records are purged lazily on
/// access; `cleanup_expired` sweeps the whole map on demand.
pub struct IdempotencyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl IdempotencyCache {
    /// Create a cache with the default 1-hour TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_TTL_SECS))
    }

    /// Create a cache with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record an outcome under `key`.
    pub fn store(&self, key: &str, result: Value, status: RecordStatus) {
        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        let record = IdempotencyRecord {
            key: key.to_string(),
            result,
            created_at,
            expires_at,
            status,
        };
        self.entries.lock().unwrap().insert(key.to_string(), record);
    }

    /// Return the cached result for `key` if it is valid.
    ///
    /// Valid ⇔ present ∧ unexpired ∧ status = success. Invalid records are
    /// removed so the next attempt re-executes.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        let record = entries.get(key)?;
        let now = Utc::now();

        if record.is_expired(now) {
            debug!(key, "idempotency record expired, purging");
            entries.remove(key);
            return None;
        }
        if record.status != RecordStatus::Success {
            debug!(key, "idempotency record is a failure, purging");
            entries.remove(key);
            return None;
        }
        Some(record.result.clone())
    }

    /// Remove every expired record. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, record| !record.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_stable_under_argument_reordering() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": "two"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": "two", "x": 1}"#).unwrap();

        assert_eq!(
            idempotency_key("researcher", "Hello {x}", &a),
            idempotency_key("researcher", "Hello {x}", &b)
        );
    }

    #[test]
    fn test_key_changes_with_each_component() {
        let args = json!({"x": 1});
        let base = idempotency_key("a", "t", &args);

        assert_ne!(base, idempotency_key("b", "t", &args));
        assert_ne!(base, idempotency_key("a", "u", &args));
        assert_ne!(base, idempotency_key("a", "t", &json!({"x": 2})));
    }

    #[test]
    fn test_key_is_16_hex_chars() {
        let key = idempotency_key("a", "t", &json!({}));
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_get_returns_stored_success() {
        let cache = IdempotencyCache::new();
        cache.store("k1", json!({"answer": 42}), RecordStatus::Success);

        assert_eq!(cache.get("k1"), Some(json!({"answer": 42})));
    }

    #[test]
    fn test_failed_records_are_never_replayed() {
        let cache = IdempotencyCache::new();
        cache.store("k1", json!("boom"), RecordStatus::Failed);

        assert_eq!(cache.get("k1"), None);
        // Purged on access.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_records_are_never_returned() {
        let cache = IdempotencyCache::with_ttl(Duration::from_secs(0));
        cache.store("k1", json!(1), RecordStatus::Success);

        assert_eq!(cache.get("k1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cleanup_expired_sweeps_only_expired() {
        let cache = IdempotencyCache::with_ttl(Duration::from_secs(0));
        cache.store("old", json!(1), RecordStatus::Success);

        let fresh = IdempotencyCache::new();
        fresh.store("new", json!(2), RecordStatus::Success);

        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(fresh.cleanup_expired(), 0);
        assert_eq!(fresh.len(), 1);
    }
}
