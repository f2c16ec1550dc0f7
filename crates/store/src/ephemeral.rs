//! In-process ephemeral store.
//!
//! Implements the TTL key-value + sorted-set contract used for invocation
//! records, active-invocation counters, and sliding-window rate limits. A
//! single `std::sync::Mutex` over the map makes every operation atomic,
//! which is exactly the guarantee the quota sequence needs (held briefly,
//! never across an await point). Expired entries are dropped lazily on
//! access.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use tmhub_core::error::StoreError;
use tmhub_core::store::{EphemeralStore, WindowDecision};

enum Value {
    Text(String),
    Counter(i64),
    /// Sorted epoch-second scores, oldest first.
    Window(Vec<i64>),
}

struct Entry {
    value: Value,
    /// Epoch seconds; entries at or past this are treated as absent.
    expires_at: Option<i64>,
}

impl Entry {
    fn expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory [`EphemeralStore`] backend.
#[derive(Default)]
pub struct InMemoryEphemeral {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryEphemeral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Called periodically by the server's
    /// housekeeping task; all other cleanup is lazy.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| !e.expired(now));
        before - entries.len()
    }

    /// Number of live entries (test helper).
    pub fn len(&self) -> usize {
        let now = Utc::now().timestamp();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|e| !e.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeral {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
            return Ok(None);
        }
        match entries.get(key) {
            Some(Entry { value: Value::Text(s), .. }) => Ok(Some(s.clone())),
            Some(Entry { value: Value::Counter(n), .. }) => Ok(Some(n.to_string())),
            Some(_) => Err(StoreError::Ephemeral(format!("'{key}' is not a string key"))),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(now + ttl_secs as i64),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
            return Ok(());
        }
        if let Some(e) = entries.get_mut(key) {
            e.expires_at = Some(now + ttl_secs as i64);
        }
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let fresh = match entries.get(key) {
            None => true,
            Some(e) => e.expired(now),
        };
        if fresh {
            entries.insert(
                key.to_string(),
                Entry { value: Value::Counter(1), expires_at: Some(now + ttl_secs as i64) },
            );
            return Ok(1);
        }
        match entries.get_mut(key) {
            Some(Entry { value: Value::Counter(n), .. }) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(StoreError::Ephemeral(format!("'{key}' is not a counter"))),
        }
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
            return Ok(0);
        }
        match entries.get_mut(key) {
            Some(Entry { value: Value::Counter(n), .. }) => {
                *n = (*n - 1).max(0);
                Ok(*n)
            }
            Some(_) => Err(StoreError::Ephemeral(format!("'{key}' is not a counter"))),
            None => Ok(0),
        }
    }

    async fn window_add(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        ttl_secs: u64,
    ) -> Result<WindowDecision, StoreError> {
        let now = Utc::now().timestamp();
        let cutoff = now - window_secs as i64;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Window(Vec::new()),
            expires_at: Some(now + ttl_secs as i64),
        });
        if entry.expired(now) {
            entry.value = Value::Window(Vec::new());
        }
        let Value::Window(scores) = &mut entry.value else {
            return Err(StoreError::Ephemeral(format!("'{key}' is not a window")));
        };

        // Trim-count-insert, atomic under the map lock.
        scores.retain(|&s| s > cutoff);
        let allowed = (scores.len() as u32) < limit;
        if allowed {
            scores.push(now);
            scores.sort_unstable();
        }
        let decision = WindowDecision {
            allowed,
            count: scores.len() as u64,
            oldest_epoch: scores.first().copied(),
        };
        entry.expires_at = Some(now + ttl_secs as i64);
        Ok(decision)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| !e.expired(now));
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, e)| match &e.value {
                Value::Text(s) => Some((k.clone(), s.clone())),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = InMemoryEphemeral::new();
        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_is_immediately_expired() {
        let store = InMemoryEphemeral::new();
        store.set_ex("k", "v", 0).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counter_increments_and_floors() {
        let store = InMemoryEphemeral::new();
        assert_eq!(store.incr_ex("c", 60).await.unwrap(), 1);
        assert_eq!(store.incr_ex("c", 60).await.unwrap(), 2);
        assert_eq!(store.decr("c").await.unwrap(), 1);
        assert_eq!(store.decr("c").await.unwrap(), 0);
        assert_eq!(store.decr("c").await.unwrap(), 0);
        assert_eq!(store.decr("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn window_enforces_limit() {
        let store = InMemoryEphemeral::new();
        for i in 0..3 {
            let d = store.window_add("w", 3, 3600, 3660).await.unwrap();
            assert!(d.allowed, "entry {i} should be allowed");
            assert_eq!(d.count, i + 1);
        }
        let denied = store.window_add("w", 3, 3600, 3660).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3);
        assert!(denied.oldest_epoch.is_some());
    }

    #[tokio::test]
    async fn window_concurrent_inserts_never_exceed_limit() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryEphemeral::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let s = store.clone();
            handles.push(tokio::spawn(async move {
                s.window_add("w", 5, 3600, 3660).await.unwrap().allowed
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn scan_prefix_filters() {
        let store = InMemoryEphemeral::new();
        store.set_ex("addon:invocation:1", "a", 60).await.unwrap();
        store.set_ex("addon:invocation:2", "b", 60).await.unwrap();
        store.set_ex("other:3", "c", 60).await.unwrap();
        let found = store.scan_prefix("addon:invocation:").await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn sweep_drops_expired() {
        let store = InMemoryEphemeral::new();
        store.set_ex("dead", "x", 0).await.unwrap();
        store.set_ex("live", "y", 60).await.unwrap();
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }
}
