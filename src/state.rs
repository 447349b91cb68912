//! Pluggable state store abstraction.
//!
//! The default backend is an in-process `dashmap`. Callers may plug in their
//! own adapter (a database, a distributed cache) to share state across
//! processes — the orchestrator itself never assumes anything beyond this
//! trait's four operations.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Async key/value store used for every piece of runtime-controls state
/// (loop, circuit, idempotency, lock, budget, exit-condition records).
///
/// `keys()` returns `None` when the adapter cannot enumerate its own keys
/// (e.g. a write-through cache in front of a system with no list operation).
/// Callers that need enumeration (loop-state pruning) should wrap such an
/// adapter in [`TrackedStateStore`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value);
    async fn delete(&self, key: &str);
    async fn keys(&self) -> Option<Vec<String>>;
}

/// Default in-memory backend.
#[derive(Default)]
pub struct InMemoryStateStore {
    map: DashMap<String, Value>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    async fn set(&self, key: &str, value: Value) {
        self.map.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        self.map.remove(key);
    }

    async fn keys(&self) -> Option<Vec<String>> {
        Some(self.map.iter().map(|e| e.key().clone()).collect())
    }
}

/// Wraps an arbitrary [`StateStore`] and tracks every key written through it,
/// so that `keys()` always returns something even when the wrapped adapter
/// cannot enumerate its own contents.
pub struct TrackedStateStore {
    inner: Arc<dyn StateStore>,
    known_keys: DashMap<String, ()>,
}

impl TrackedStateStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            known_keys: DashMap::new(),
        }
    }
}

#[async_trait]
impl StateStore for TrackedStateStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) {
        self.known_keys.insert(key.to_string(), ());
        self.inner.set(key, value).await;
    }

    async fn delete(&self, key: &str) {
        self.known_keys.remove(key);
        self.inner.delete(key).await;
    }

    async fn keys(&self) -> Option<Vec<String>> {
        match self.inner.keys().await {
            Some(keys) => Some(keys),
            None => Some(self.known_keys.iter().map(|e| e.key().clone()).collect()),
        }
    }
}

/// Namespaces every key under a tenant prefix so that a single shared
/// backend can serve multiple isolated tenants.
pub struct TenantStateStore {
    inner: Arc<dyn StateStore>,
    tenant: String,
}

impl TenantStateStore {
    pub fn new(inner: Arc<dyn StateStore>, tenant: impl Into<String>) -> Self {
        Self {
            inner,
            tenant: tenant.into(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.tenant, key)
    }
}

#[async_trait]
impl StateStore for TenantStateStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(&self.namespaced(key)).await
    }

    async fn set(&self, key: &str, value: Value) {
        self.inner.set(&self.namespaced(key), value).await;
    }

    async fn delete(&self, key: &str) {
        self.inner.delete(&self.namespaced(key)).await;
    }

    async fn keys(&self) -> Option<Vec<String>> {
        let prefix = format!("{}:", self.tenant);
        self.inner.keys().await.map(|keys| {
            keys.into_iter()
                .filter_map(|k| k.strip_prefix(prefix.as_str()).map(|s| s.to_string()))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_store_roundtrips() {
        let store = InMemoryStateStore::new();
        store.set("k", json!({"a": 1})).await;
        assert_eq!(store.get("k").await, Some(json!({"a": 1})));
        store.delete("k").await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn tracked_store_falls_back_to_known_keys_when_inner_cannot_enumerate() {
        struct NoKeysStore {
            inner: InMemoryStateStore,
        }
        #[async_trait]
        impl StateStore for NoKeysStore {
            async fn get(&self, key: &str) -> Option<Value> {
                self.inner.get(key).await
            }
            async fn set(&self, key: &str, value: Value) {
                self.inner.set(key, value).await;
            }
            async fn delete(&self, key: &str) {
                self.inner.delete(key).await;
            }
            async fn keys(&self) -> Option<Vec<String>> {
                None
            }
        }

        let tracked = TrackedStateStore::new(Arc::new(NoKeysStore {
            inner: InMemoryStateStore::new(),
        }));
        tracked.set("a", json!(1)).await;
        tracked.set("b", json!(2)).await;
        let mut keys = tracked.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        tracked.delete("a").await;
        let keys = tracked.keys().await.unwrap();
        assert_eq!(keys, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn tenant_store_isolates_keys_between_tenants() {
        let backend: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let tenant_a = TenantStateStore::new(backend.clone(), "tenant-a");
        let tenant_b = TenantStateStore::new(backend.clone(), "tenant-b");

        tenant_a.set("run", json!(1)).await;
        assert_eq!(tenant_a.get("run").await, Some(json!(1)));
        assert_eq!(tenant_b.get("run").await, None);

        let keys = tenant_a.keys().await.unwrap();
        assert_eq!(keys, vec!["run".to_string()]);
    }
}
