//! Table storage
//!
//! Tables are ordered lists of column-addressed rows. Three providers ship:
//!
//! - [`MemoryTableProvider`]: process-local, used by tests and scratch stores
//! - [`JsonlTableProvider`]: one `<table>.jsonl` file per table, one row per line
//! - [`StagedTableProvider`]: buffers writes over another provider until
//!   [`StagedTableProvider::commit`]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// One table row
pub type Row = serde_json::Map<String, Value>;

/// File extension used by [`JsonlTableProvider`]
pub const TABLE_EXTENSION: &str = "jsonl";

/// Storage collaborator for graph tables
#[async_trait]
pub trait TableProvider: Send + Sync + std::fmt::Debug {
    /// Read every row of `name`; `TableNotFound` when absent
    async fn read_table(&self, name: &str) -> Result<Vec<Row>>;

    /// Replace the contents of `name`
    async fn write_table(&self, name: &str, rows: Vec<Row>) -> Result<()>;

    async fn has_table(&self, name: &str) -> Result<bool>;

    /// Table names, sorted
    async fn list_tables(&self) -> Result<Vec<String>>;
}

/// Read `name` and deserialize each row into `T`
pub async fn read_records<T: DeserializeOwned>(
    provider: &dyn TableProvider,
    name: &str,
) -> Result<Vec<T>> {
    provider
        .read_table(name)
        .await?
        .into_iter()
        .map(|row| serde_json::from_value(Value::Object(row)).map_err(Error::from))
        .collect()
}

/// Like [`read_records`] but an absent table reads as empty
pub async fn read_records_or_empty<T: DeserializeOwned>(
    provider: &dyn TableProvider,
    name: &str,
) -> Result<Vec<T>> {
    if provider.has_table(name).await? {
        read_records(provider, name).await
    } else {
        Ok(Vec::new())
    }
}

/// Serialize `records` and write them as table `name`
pub async fn write_records<T: Serialize>(
    provider: &dyn TableProvider,
    name: &str,
    records: &[T],
) -> Result<()> {
    let rows = records
        .iter()
        .map(to_row)
        .collect::<Result<Vec<_>>>()?;
    provider.write_table(name, rows).await
}

/// Serialize one record into a row
pub fn to_row<T: Serialize>(record: &T) -> Result<Row> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(Error::InvalidInput(format!(
            "table rows must serialize to objects, got {}",
            other
        ))),
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryTableProvider {
    tables: RwLock<BTreeMap<String, Vec<Row>>>,
}

impl MemoryTableProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableProvider for MemoryTableProvider {
    async fn read_table(&self, name: &str) -> Result<Vec<Row>> {
        self.tables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    async fn write_table(&self, name: &str, rows: Vec<Row>) -> Result<()> {
        self.tables.write().await.insert(name.to_string(), rows);
        Ok(())
    }

    async fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.tables.read().await.contains_key(name))
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.read().await.keys().cloned().collect())
    }
}

// ============================================================================
// JSONL directory
// ============================================================================

/// Tables stored as `<base_dir>/<name>.jsonl`
///
/// Rows are written in table order, one JSON object per line, so diffs of
/// consecutive runs stay readable.
#[derive(Debug, Clone)]
pub struct JsonlTableProvider {
    base_dir: PathBuf,
}

impl JsonlTableProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn table_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::InvalidInput(format!("invalid table name '{}'", name)));
        }
        Ok(self
            .base_dir
            .join(format!("{}.{}", name, TABLE_EXTENSION)))
    }
}

#[async_trait]
impl TableProvider for JsonlTableProvider {
    async fn read_table(&self, name: &str) -> Result<Vec<Row>> {
        let path = self.table_path(name)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::TableNotFound(name.to_string()));
            }
            Err(err) => {
                return Err(Error::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    err
                )));
            }
        };

        let mut rows = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(line).map_err(|err| {
                Error::Storage(format!(
                    "{}:{}: invalid row: {}",
                    path.display(),
                    line_num + 1,
                    err
                ))
            })?;
            rows.push(row);
        }
        debug!(table = %name, rows = rows.len(), "Read table");
        Ok(rows)
    }

    async fn write_table(&self, name: &str, rows: Vec<Row>) -> Result<()> {
        let path = self.table_path(name)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let mut content = String::new();
        for row in &rows {
            content.push_str(&serde_json::to_string(row)?);
            content.push('\n');
        }

        let tmp = path.with_extension(format!("{}.tmp", TABLE_EXTENSION));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(table = %name, rows = rows.len(), path = %path.display(), "Wrote table");
        Ok(())
    }

    async fn has_table(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.table_path(name)?).await?)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TABLE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// Staged writes
// ============================================================================

/// Write buffer over another provider.
///
/// Reads see staged tables first. Nothing reaches the inner provider until
/// [`commit`](Self::commit), so a failed run leaves it untouched.
#[derive(Debug)]
pub struct StagedTableProvider {
    inner: Arc<dyn TableProvider>,
    staged: RwLock<BTreeMap<String, Vec<Row>>>,
}

impl StagedTableProvider {
    pub fn new(inner: Arc<dyn TableProvider>) -> Self {
        Self {
            inner,
            staged: RwLock::new(BTreeMap::new()),
        }
    }

    /// Names of tables waiting to be committed
    pub async fn staged_tables(&self) -> Vec<String> {
        self.staged.read().await.keys().cloned().collect()
    }

    /// Flush staged tables to the inner provider
    pub async fn commit(&self) -> Result<Vec<String>> {
        let staged = std::mem::take(&mut *self.staged.write().await);
        let names: Vec<String> = staged.keys().cloned().collect();
        for (name, rows) in staged {
            self.inner.write_table(&name, rows).await?;
        }
        debug!(tables = ?names, "Committed staged tables");
        Ok(names)
    }

    /// Drop staged tables without writing them
    pub async fn discard(&self) {
        self.staged.write().await.clear();
    }
}

#[async_trait]
impl TableProvider for StagedTableProvider {
    async fn read_table(&self, name: &str) -> Result<Vec<Row>> {
        if let Some(rows) = self.staged.read().await.get(name) {
            return Ok(rows.clone());
        }
        self.inner.read_table(name).await
    }

    async fn write_table(&self, name: &str, rows: Vec<Row>) -> Result<()> {
        self.staged.write().await.insert(name.to_string(), rows);
        Ok(())
    }

    async fn has_table(&self, name: &str) -> Result<bool> {
        if self.staged.read().await.contains_key(name) {
            return Ok(true);
        }
        self.inner.has_table(name).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = self.inner.list_tables().await?;
        names.extend(self.staged.read().await.keys().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::Entity;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_memory_missing_table() {
        let provider = MemoryTableProvider::new();
        assert!(!provider.has_table("entities").await.unwrap());
        assert!(matches!(
            provider.read_table("entities").await,
            Err(Error::TableNotFound(_))
        ));
        let empty: Vec<Entity> = read_records_or_empty(&provider, "entities").await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_typed_records_through_provider() {
        let provider = MemoryTableProvider::new();
        let entities = vec![
            Entity::new("1", "ALICE").with_type("person"),
            Entity::new("2", "ACME").with_type("organization"),
        ];
        write_records(&provider, "entities", &entities).await.unwrap();

        let back: Vec<Entity> = read_records(&provider, "entities").await.unwrap();
        assert_eq!(back, entities);
        assert_eq!(provider.list_tables().await.unwrap(), vec!["entities"]);
    }

    #[tokio::test]
    async fn test_jsonl_one_row_per_line() {
        let dir = TempDir::new().unwrap();
        let provider = JsonlTableProvider::new(dir.path().join("output"));
        provider
            .write_table(
                "documents",
                vec![row(json!({"id": "d1", "text": "a"})), row(json!({"id": "d2", "text": "b"}))],
            )
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("output/documents.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);

        let rows = provider.read_table("documents").await.unwrap();
        assert_eq!(rows[1]["id"], "d2");
        assert!(provider.has_table("documents").await.unwrap());
        assert_eq!(provider.list_tables().await.unwrap(), vec!["documents"]);
    }

    #[tokio::test]
    async fn test_jsonl_reports_bad_line() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("entities.jsonl"), "{\"id\":\"1\"}\nnot json\n").unwrap();
        let provider = JsonlTableProvider::new(dir.path());

        let err = provider.read_table("entities").await.unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }

    #[tokio::test]
    async fn test_jsonl_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let provider = JsonlTableProvider::new(dir.path());
        assert!(provider.write_table("../escape", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let inner = Arc::new(MemoryTableProvider::new());
        let staged = StagedTableProvider::new(inner.clone());

        staged
            .write_table("entities", vec![row(json!({"id": "1"}))])
            .await
            .unwrap();
        assert!(staged.has_table("entities").await.unwrap());
        assert!(!inner.has_table("entities").await.unwrap());

        let committed = staged.commit().await.unwrap();
        assert_eq!(committed, vec!["entities"]);
        assert!(inner.has_table("entities").await.unwrap());
        assert!(staged.staged_tables().await.is_empty());
    }

    #[tokio::test]
    async fn test_staged_discard() {
        let inner = Arc::new(MemoryTableProvider::new());
        let staged = StagedTableProvider::new(inner.clone());
        staged.write_table("entities", Vec::new()).await.unwrap();
        staged.discard().await;
        staged.commit().await.unwrap();
        assert!(!inner.has_table("entities").await.unwrap());
    }
}
