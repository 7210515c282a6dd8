//! Record store collaborators (Ninox REST, JSON directory) and the raw batch archive.

use async_trait::async_trait;
use cove_core::CanonicalRecord;
use thiserror::Error;

mod archive;
mod atomic;
mod file;
mod ninox;

pub use archive::{ArchivedBatch, BatchArchive};
pub use file::JsonFileStore;
pub use ninox::{
    classify_reqwest_error, classify_status, BackoffPolicy, NinoxConfig, NinoxStore, RetryDisposition,
};

pub const CRATE_NAME: &str = "cove-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding records of table {table}: {source}")]
    Decode {
        table: String,
        source: serde_json::Error,
    },
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("invalid filter {filter}: {reason}")]
    Filter { filter: String, reason: String },
    #[error("{path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("store configuration: {0}")]
    Config(String),
}

/// Where canonical partitions and screening tables live.
///
/// `filter` is passed through untouched; its syntax belongs to the store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, table: &str, filter: Option<&str>) -> Result<Vec<CanonicalRecord>, StoreError>;

    /// Records with `id == 0` are inserted, the rest are partially updated.
    /// Returns the number of records written.
    async fn upsert(&self, table: &str, records: &[CanonicalRecord]) -> Result<usize, StoreError>;

    /// Removes the records with the given ids. Unknown ids are ignored.
    /// Returns the number of records removed.
    async fn delete(&self, table: &str, ids: &[u64]) -> Result<usize, StoreError>;
}
