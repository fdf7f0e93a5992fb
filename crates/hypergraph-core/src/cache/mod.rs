//! Namespaced completion cache
//!
//! This module provides:
//! - [`Cache`]: JSON values stored under a namespace path
//! - Child scoping (`cache.child("extract_graph")`) that shares the backend
//! - Content-addressed keys via [`create_cache_key`]
//! - Pluggable backends (memory, JSON file tree, no-op)
//!
//! Clearing a namespace only removes entries under that namespace; sibling
//! children are unaffected.

mod backend;
mod key;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

pub use backend::{
    CacheBackend, CacheBackendFactory, CacheBackendRegistry, FileCacheBackend,
    MemoryCacheBackend, NoopCacheBackend, default_cache_backends,
};
pub use key::create_cache_key;

/// Handle onto a namespace of a shared cache backend
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    namespace: Vec<String>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.backend.name())
            .field("namespace", &self.namespace())
            .finish()
    }
}

impl Cache {
    /// Root cache over the given backend
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            namespace: Vec::new(),
        }
    }

    /// In-memory root cache
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    /// Cache that never stores anything
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopCacheBackend))
    }

    /// Child cache scoped under `namespace/name`
    pub fn child(&self, name: &str) -> Self {
        let mut namespace = self.namespace.clone();
        namespace.extend(
            name.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        );
        Self {
            backend: Arc::clone(&self.backend),
            namespace,
        }
    }

    /// Namespace path, `/`-separated (empty for the root)
    pub fn namespace(&self) -> String {
        self.namespace.join("/")
    }

    /// Name of the underlying backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn full_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.namespace(), key)
        }
    }

    /// Fetch a value; unreadable entries are reported as a miss
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let Some(bytes) = self.backend.get(&self.full_key(key)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(namespace = %self.namespace(), key = %key, error = %e, "Discarding corrupt cache entry");
                Ok(None)
            }
        }
    }

    /// Fetch and deserialize into `T`; a shape mismatch is a miss
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|value| serde_json::from_value(value).ok()))
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.set(&self.full_key(key), bytes).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.backend.has(&self.full_key(key)).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(&self.full_key(key)).await
    }

    /// Remove every entry under this namespace
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear(&self.namespace()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set_has_delete() {
        let cache = Cache::memory();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", &json!({"content": "hello"})).await.unwrap();
        assert!(cache.has("k").await.unwrap());
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(json!({"content": "hello"}))
        );

        cache.delete("k").await.unwrap();
        assert!(!cache.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_children_share_backend_but_not_keys() {
        let root = Cache::memory();
        let extract = root.child("extract_graph");
        let summarize = root.child("summarize_descriptions");

        extract.set("k", &1).await.unwrap();
        summarize.set("k", &2).await.unwrap();

        assert_eq!(extract.get_as::<i32>("k").await.unwrap(), Some(1));
        assert_eq!(summarize.get_as::<i32>("k").await.unwrap(), Some(2));
        assert_eq!(root.get_as::<i32>("extract_graph/k").await.unwrap(), Some(1));

        extract.clear().await.unwrap();
        assert_eq!(extract.get("k").await.unwrap(), None);
        assert_eq!(summarize.get_as::<i32>("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_nested_child_namespace() {
        let cache = Cache::memory().child("a").child("b/c");
        assert_eq!(cache.namespace(), "a/b/c");
    }

    #[tokio::test]
    async fn test_disabled_cache_misses() {
        let cache = Cache::disabled();
        cache.set("k", &"v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.backend_name(), "none");
    }

    #[tokio::test]
    async fn test_get_as_shape_mismatch_is_miss() {
        let cache = Cache::memory();
        cache.set("k", &"not a number").await.unwrap();
        assert_eq!(cache.get_as::<u64>("k").await.unwrap(), None);
    }
}
