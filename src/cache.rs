use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

/// Advisory keyed cache with TTL and prefix invalidation.
///
/// Committed writes to resources or reservations invalidate `resources:*`
/// and `dashboard:*` keys fire-and-forget. Races are benign — the store is
/// the source of truth and a stale read resolves on the next write.
///
/// Cloning is cheap — clones share the same underlying map via Arc.
#[derive(Debug, Clone)]
pub struct KeyedCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Prefixes invalidated on any committed booking or resource write.
pub const RESOURCE_PREFIXES: &[&str] = &["resources:", "dashboard:"];

impl KeyedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: &str, value: Value) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every key starting with `prefix`. Returns the number removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Drop all resource-derived keys after a committed booking write.
    pub async fn invalidate_resources(&self) {
        for prefix in RESOURCE_PREFIXES {
            self.invalidate_prefix(prefix).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
