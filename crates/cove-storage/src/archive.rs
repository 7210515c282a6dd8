use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cove_core::CanonicalRecord;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::atomic::write_atomically;

#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub records: usize,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, content-addressed copies of the batches a run consumed.
#[derive(Debug, Clone)]
pub struct BatchArchive {
    root: PathBuf,
}

impl BatchArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_relative_path(&self, fetched_at: DateTime<Utc>, table: &str, content_hash: &str) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        PathBuf::from(day).join(table).join(format!("{content_hash}.json"))
    }

    /// Stores the batch as JSON under a hash-addressed path. Identical batches
    /// fetched on the same day share one file.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        table: &str,
        records: &[CanonicalRecord],
    ) -> anyhow::Result<ArchivedBatch> {
        let bytes = serde_json::to_vec(records).with_context(|| format!("serializing {table} batch"))?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.batch_relative_path(fetched_at, table, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let batch = |deduplicated| ArchivedBatch {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            records: records.len(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(batch(true));
        }

        write_atomically(&absolute_path, &bytes)
            .await
            .with_context(|| format!("writing archive batch {}", absolute_path.display()))?;
        Ok(batch(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_core::Fields;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            BatchArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_batches_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let archive = BatchArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2020-04-17T11:13:44Z")
            .expect("ts")
            .with_timezone(&Utc);
        let mut fields = Fields::new();
        fields.insert("TrialID".into(), "ChiCTR2000029308".into());
        let records = vec![CanonicalRecord::new(1, fields)];

        let first = archive.archive(fetched_at, "ictrp", &records).await.expect("first");
        let second = archive.archive(fetched_at, "ictrp", &records).await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20200417/ictrp"));
        assert_eq!(first.records, 1);
        assert!(first.absolute_path.exists());
    }
}
