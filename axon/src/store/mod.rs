//! Long-term store: hierarchical namespaced KV with TTL and search.
//!
//! A [`Namespace`] is an ordered sequence of path segments (e.g.
//! `["users", "alice", "memories"]`). The [`Store`] trait is the boundary
//! the core consumes; backends (memory, Redis, SQL, vector stores) live
//! below it. Search relevance is backend-defined; the in-memory backend
//! ranks by substring occurrence.
//!
//! TTL expiry is lazy: an expired item may linger until garbage-collected,
//! but `get` treats it as absent.
//!
//! # Main types
//!
//! - [`Store`]: `get` / `put` / `delete` / `search` / `list` over namespaces.
//! - [`InMemoryStore`]: the bundled backend; `sweep()` collects expired rows.
//! - [`SearchHit`]: a ranked search result.
//!
//! **Interaction**: shared across sessions (`Arc<dyn Store>`); the
//! checkpointer's store-backed saver and runtime-aware tools go through it.

mod in_memory;

pub use in_memory::InMemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Ordered path segments addressing a hierarchy level.
pub type Namespace = Vec<String>;

/// Builds a namespace from string-ish segments.
pub fn namespace<I, S>(segments: I) -> Namespace
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    segments.into_iter().map(Into::into).collect()
}

/// Error type for store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("backend: {0}")]
    Backend(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
}

impl StoreError {
    /// Backend faults are worth retrying; the rest are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// One search result with its backend-defined relevance score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub namespace: Namespace,
    pub key: String,
    pub value: Value,
    pub score: f64,
}

/// Hierarchical KV storage with TTL and search.
///
/// Implementations must be task-safe; the store is shared across sessions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads one value. Expired entries are treated as absent.
    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Value>, StoreError>;

    /// Writes one value, optionally expiring after `ttl`.
    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Removes one value. Removing an absent key is not an error.
    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), StoreError>;

    /// Returns at most `limit` hits under `namespace` ranked by relevance
    /// to `query`. Semantics below the trait are backend-defined.
    async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Lists keys under `namespace`, sorted.
    async fn list(&self, namespace: &Namespace) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_builder_collects_segments() {
        let ns = namespace(["a", "b"]);
        assert_eq!(ns, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn only_backend_errors_are_transient() {
        assert!(StoreError::Backend("io".into()).is_transient());
        assert!(!StoreError::Serialization("bad".into()).is_transient());
        assert!(!StoreError::InvalidNamespace("".into()).is_transient());
    }
}
