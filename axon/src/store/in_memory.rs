//! In-memory Store. Not persistent.
//!
//! Search is substring-ranked over keys and serialized values; TTL expiry is
//! lazy, with `sweep()` as the garbage-collection hook.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Namespace, SearchHit, Store, StoreError};

#[derive(Debug, Clone)]
struct StoredItem {
    namespace: Namespace,
    key: String,
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Key for the inner map: namespace joined by "\0", then key. Enables list
/// and search by namespace prefix.
fn map_key(namespace: &Namespace, key: &str) -> String {
    format!("{}\0{}", namespace.join("\0"), key)
}

fn namespace_prefix(namespace: &Namespace) -> String {
    if namespace.is_empty() {
        String::new()
    } else {
        format!("{}\0", namespace.join("\0"))
    }
}

/// In-memory [`Store`] backend.
///
/// **Interaction**: handed to the runtime as `Arc<dyn Store>`; shared across
/// sessions, so all access goes through the async lock.
pub struct InMemoryStore {
    inner: RwLock<HashMap<String, StoredItem>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Removes every expired entry. Returns how many were collected.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|_, item| !item.is_expired(now));
        before - guard.len()
    }

    /// Number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .values()
            .filter(|item| !item.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Occurrences of `needle` in `haystack`, case-insensitive.
fn occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.to_lowercase().matches(&needle.to_lowercase()).count()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Value>, StoreError> {
        let k = map_key(namespace, key);
        let now = Instant::now();
        Ok(self
            .inner
            .read()
            .await
            .get(&k)
            .filter(|item| !item.is_expired(now))
            .map(|item| item.value.clone()))
    }

    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let k = map_key(namespace, key);
        let item = StoredItem {
            namespace: namespace.clone(),
            key: key.to_string(),
            value: value.clone(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.inner.write().await.insert(k, item);
        Ok(())
    }

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), StoreError> {
        let k = map_key(namespace, key);
        self.inner.write().await.remove(&k);
        Ok(())
    }

    async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let prefix = namespace_prefix(namespace);
        let now = Instant::now();
        let guard = self.inner.read().await;

        let mut hits: Vec<SearchHit> = guard
            .iter()
            .filter(|(k, item)| k.starts_with(&prefix) && !item.is_expired(now))
            .filter_map(|(_, item)| {
                let score = (occurrences(&item.key, query)
                    + occurrences(&item.value.to_string(), query))
                    as f64;
                if query.is_empty() || score > 0.0 {
                    Some(SearchHit {
                        namespace: item.namespace.clone(),
                        key: item.key.clone(),
                        value: item.value.clone(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn list(&self, namespace: &Namespace) -> Result<Vec<String>, StoreError> {
        let prefix = namespace_prefix(namespace);
        let now = Instant::now();
        let guard = self.inner.read().await;
        let mut keys: Vec<String> = guard
            .iter()
            .filter(|(k, item)| k.starts_with(&prefix) && !item.is_expired(now))
            .map(|(_, item)| item.key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::namespace;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_within_ttl() {
        let store = InMemoryStore::new();
        let ns = namespace(["a"]);
        store
            .put(&ns, "k", &json!({"v": 1}), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get(&ns, "k").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let store = InMemoryStore::new();
        let ns = namespace(["a"]);
        store
            .put(&ns, "k", &json!(1), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get(&ns, "k").await.unwrap(), None);
        // Still physically present until swept.
        assert_eq!(store.sweep().await, 1);
    }

    #[tokio::test]
    async fn list_is_scoped_to_namespace_and_sorted() {
        let store = InMemoryStore::new();
        store
            .put(&namespace(["a"]), "b", &json!(1), None)
            .await
            .unwrap();
        store
            .put(&namespace(["a"]), "a", &json!(2), None)
            .await
            .unwrap();
        store
            .put(&namespace(["other"]), "z", &json!(3), None)
            .await
            .unwrap();
        assert_eq!(
            store.list(&namespace(["a"])).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn nested_namespaces_are_listed_under_their_prefix() {
        let store = InMemoryStore::new();
        store
            .put(&namespace(["users", "alice"]), "m1", &json!("x"), None)
            .await
            .unwrap();
        store
            .put(&namespace(["users", "bob"]), "m2", &json!("y"), None)
            .await
            .unwrap();
        let all = store.list(&namespace(["users"])).await.unwrap();
        assert_eq!(all, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn search_ranks_by_occurrences_and_respects_limit() {
        let store = InMemoryStore::new();
        let ns = namespace(["notes"]);
        store
            .put(&ns, "one", &json!("rust rust rust"), None)
            .await
            .unwrap();
        store.put(&ns, "two", &json!("rust"), None).await.unwrap();
        store.put(&ns, "three", &json!("go"), None).await.unwrap();

        let hits = store.search(&ns, "rust", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "one");
        assert!(hits[0].score > hits[1].score);

        let limited = store.search(&ns, "rust", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        let ns = namespace(["a"]);
        store.put(&ns, "k", &json!(1), None).await.unwrap();
        store.delete(&ns, "k").await.unwrap();
        store.delete(&ns, "k").await.unwrap();
        assert_eq!(store.get(&ns, "k").await.unwrap(), None);
    }
}
