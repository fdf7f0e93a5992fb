//! Cache storage backends
//!
//! Backends are byte-oriented key/value stores with `/`-separated
//! hierarchical keys. Scoping and serialization live in [`super::Cache`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::Registry;

/// Storage behind a [`super::Cache`]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend discriminator, as used in configuration
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key under `prefix` (everything when `prefix` is empty)
    async fn clear(&self, prefix: &str) -> Result<()>;
}

/// Constructor signature stored in the cache backend registry
pub type CacheBackendFactory = dyn Fn(&Path) -> Result<Arc<dyn CacheBackend>> + Send + Sync;

/// Registry of cache backends keyed by `cache.backend`
pub type CacheBackendRegistry = Registry<CacheBackendFactory>;

/// Registry pre-populated with `memory`, `file` and `none`
pub fn default_cache_backends() -> CacheBackendRegistry {
    let mut registry = CacheBackendRegistry::new("cache");
    registry
        .register(
            "memory",
            Arc::new(|_: &Path| Ok(Arc::new(MemoryCacheBackend::new()) as Arc<dyn CacheBackend>)),
        )
        .register(
            "file",
            Arc::new(|base_dir: &Path| {
                Ok(Arc::new(FileCacheBackend::new(base_dir)) as Arc<dyn CacheBackend>)
            }),
        )
        .register(
            "none",
            Arc::new(|_: &Path| Ok(Arc::new(NoopCacheBackend) as Arc<dyn CacheBackend>)),
        );
    registry
}

fn under_prefix(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// In-process cache backed by a hash map
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all namespaces
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .retain(|key, _| !under_prefix(key, prefix));
        Ok(())
    }
}

/// JSON file tree: each namespace segment is a directory, each key a file
#[derive(Debug, Clone)]
pub struct FileCacheBackend {
    base_dir: PathBuf,
}

impl FileCacheBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn dir_for(&self, prefix: &str) -> PathBuf {
        prefix
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.base_dir.clone(), |path, segment| {
                path.join(sanitize_segment(segment))
            })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.dir_for(key);
        let file_name = path
            .file_name()
            .map(|name| format!("{}.json", name.to_string_lossy()))
            .unwrap_or_else(|| "_.json".to_string());
        path.set_file_name(file_name);
        path
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_.-]` so distinct segments
/// never share a directory. `.` and `..` are encoded whole.
fn sanitize_segment(segment: &str) -> String {
    if segment == "." || segment == ".." {
        return segment.replace('.', "%2E");
    }
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Cache(format!("failed to read '{}': {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so concurrent readers never see a torn entry
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| Error::Cache(format!("failed to write '{}': {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Cache(format!("failed to commit '{}': {}", key, e)))?;

        debug!(key = %key, bytes = value.len(), "Cache entry written");
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let dir = self.dir_for(prefix);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(());
        }
        if prefix.is_empty() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(entry.path()).await?;
                } else {
                    tokio::fs::remove_file(entry.path()).await?;
                }
            }
        } else {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Backend that stores nothing; every lookup misses
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheBackend;

#[async_trait]
impl CacheBackend for NoopCacheBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn has(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn clear(&self, _prefix: &str) -> Result<()> {
        Ok(())
    }
}
