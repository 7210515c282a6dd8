use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cove_core::{CanonicalRecord, FieldValue};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::atomic::write_atomically;
use crate::{RecordStore, StoreError};

/// One `<table>.json` file per table, each holding a JSON array of records.
///
/// Understands the `{"fields": {name: value}}` equality filter.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Deserialize)]
struct FieldFilter {
    #[serde(default)]
    fields: BTreeMap<String, JsonValue>,
}

impl FieldFilter {
    fn parse(filter: &str) -> Result<Vec<(String, String)>, StoreError> {
        let parsed: FieldFilter = serde_json::from_str(filter).map_err(|e| StoreError::Filter {
            filter: filter.to_string(),
            reason: e.to_string(),
        })?;
        Ok(parsed
            .fields
            .into_iter()
            .map(|(name, value)| {
                let expected = FieldValue::from_json(value)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                (name, expected)
            })
            .collect())
    }
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, table: &str) -> Result<PathBuf, StoreError> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        Ok(self.dir.join(format!("{table}.json")))
    }

    async fn read_table(&self, table: &str) -> Result<Vec<CanonicalRecord>, StoreError> {
        let path = self.table_path(table)?;
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        if !fs::try_exists(&path).await.map_err(io_err)? {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).await.map_err(io_err)?;
        serde_json::from_str(&text).map_err(|source| StoreError::Decode {
            table: table.to_string(),
            source,
        })
    }

    async fn write_table(&self, table: &str, records: &[CanonicalRecord]) -> Result<(), StoreError> {
        let path = self.table_path(table)?;
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let bytes = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Decode {
            table: table.to_string(),
            source,
        })?;
        write_atomically(&path, &bytes).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, table: &str, filter: Option<&str>) -> Result<Vec<CanonicalRecord>, StoreError> {
        let conditions = match filter {
            Some(f) if !f.trim().is_empty() => FieldFilter::parse(f)?,
            _ => Vec::new(),
        };
        let records = self.read_table(table).await?;
        Ok(records
            .into_iter()
            .filter(|r| conditions.iter().all(|(name, expected)| r.field_str(name) == *expected))
            .collect())
    }

    async fn upsert(&self, table: &str, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut existing = self.read_table(table).await?;
        let mut next_id = existing.iter().map(|r| r.id).max().unwrap_or(0) + 1;

        for record in records {
            if record.id != 0 {
                if let Some(target) = existing.iter_mut().find(|r| r.id == record.id) {
                    target
                        .fields
                        .extend(record.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    continue;
                }
                next_id = next_id.max(record.id + 1);
                existing.push(record.clone());
                continue;
            }

            let mut inserted = record.clone();
            inserted.id = next_id;
            next_id += 1;
            existing.push(inserted);
        }

        self.write_table(table, &existing).await?;
        info!(table, written = records.len(), "upserted records");
        Ok(records.len())
    }

    async fn delete(&self, table: &str, ids: &[u64]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut existing = self.read_table(table).await?;
        let before = existing.len();
        existing.retain(|r| !ids.contains(&r.id));
        let removed = before - existing.len();
        if removed > 0 {
            self.write_table(table, &existing).await?;
        }
        info!(table, removed, "deleted records");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_core::Fields;
    use tempfile::tempdir;

    fn record(id: u64, pairs: &[(&str, &str)]) -> CanonicalRecord {
        let fields: Fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect();
        CanonicalRecord::new(id, fields)
    }

    #[tokio::test]
    async fn missing_table_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert!(store.fetch("exclusions", None).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn upsert_inserts_then_merges_partial_updates() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        store
            .upsert(
                "covebasic",
                &[record(0, &[("source", "ICTRP"), ("title", "First"), ("title_certainty", "prefilled")])],
            )
            .await
            .expect("insert");
        let stored = store.fetch("covebasic", None).await.expect("fetch");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, 1);

        store
            .upsert("covebasic", &[record(1, &[("status", "recruiting")])])
            .await
            .expect("update");
        let stored = store.fetch("covebasic", None).await.expect("fetch");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].field_str("title"), "First");
        assert_eq!(stored[0].field_str("status"), "recruiting");
    }

    #[tokio::test]
    async fn field_filter_matches_on_string_rendering() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store
            .upsert(
                "ictrp",
                &[
                    record(0, &[("TrialID", "A"), ("cove_screening", "include")]),
                    record(0, &[("TrialID", "B"), ("cove_screening", "exclude")]),
                ],
            )
            .await
            .expect("seed");

        let included = store
            .fetch("ictrp", Some(r#"{"fields":{"cove_screening":"include"}}"#))
            .await
            .expect("fetch");
        assert_eq!(included.len(), 1);
        assert_eq!(included[0].field_str("TrialID"), "A");

        let err = store.fetch("ictrp", Some("cove_screening=include")).await.expect_err("bad filter");
        assert!(matches!(err, StoreError::Filter { .. }));
    }

    #[tokio::test]
    async fn delete_removes_only_the_given_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store
            .upsert(
                "covebasic",
                &[
                    record(0, &[("source_id", "A")]),
                    record(0, &[("source_id", "B")]),
                    record(0, &[("source_id", "C")]),
                ],
            )
            .await
            .expect("seed");

        let removed = store.delete("covebasic", &[1, 3, 99]).await.expect("delete");
        assert_eq!(removed, 2);

        let stored = store.fetch("covebasic", None).await.expect("fetch");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].field_str("source_id"), "B");
        assert_eq!(store.delete("exclusions", &[1]).await.expect("empty table"), 0);
    }

    #[test]
    fn table_names_cannot_escape_the_directory() {
        let store = JsonFileStore::new("/tmp/cove");
        assert!(store.table_path("../etc/passwd").is_err());
        assert!(store.table_path("covebasic").is_ok());
    }
}
