//! Import orchestration: source registry, store wiring, runs and reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use cove_core::{convert, DedupIndex, ExistingPolicy, Partition};
use cove_sources::field_map_for_source;
use cove_storage::{BatchArchive, JsonFileStore, NinoxConfig, NinoxStore, RecordStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

mod maintenance;
mod report;
mod review;

pub use maintenance::{MoveDirection, MoveSummary};
pub use report::{report_recent_markdown, summary_markdown};
pub use review::{DuplicateCandidate, TitleReviewer, DEFAULT_REVIEW_THRESHOLD};

pub const CRATE_NAME: &str = "cove-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Ninox,
    File,
}

impl StoreKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ninox" => Ok(StoreKind::Ninox),
            "file" | "" => Ok(StoreKind::File),
            other => bail!("unknown store kind {other:?}, expected `ninox` or `file`"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store: StoreKind,
    pub data_dir: PathBuf,
    pub ninox_base_url: String,
    pub ninox_api_key: String,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub review_threshold: f64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            workspace_root: std::env::var("COVE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            store: StoreKind::parse(&std::env::var("COVE_STORE").unwrap_or_default())
                .context("reading COVE_STORE")?,
            data_dir: std::env::var("COVE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            ninox_base_url: std::env::var("NINOX_BASE_URL").unwrap_or_default(),
            ninox_api_key: std::env::var("NINOX_API_KEY").unwrap_or_default(),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            user_agent: std::env::var("COVE_USER_AGENT").unwrap_or_else(|_| "cove-import/0.1".to_string()),
            http_timeout_secs: std::env::var("COVE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            review_threshold: std::env::var("COVE_REVIEW_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REVIEW_THRESHOLD),
        })
    }

    /// File-store configuration with data, artifacts and reports under `root`.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store: StoreKind::File,
            data_dir: root.join("data"),
            ninox_base_url: String::new(),
            ninox_api_key: String::new(),
            artifacts_dir: root.join("artifacts"),
            user_agent: "cove-import/0.1".to_string(),
            http_timeout_secs: 30,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
            workspace_root: root,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    /// Logical table name -> store location (Ninox `databases/<db>/tables/<T>`).
    #[serde(default)]
    pub tables: BTreeMap<String, String>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub screening_table: String,
    #[serde(default)]
    pub screening_filter: Option<String>,
    #[serde(default)]
    pub existing_policy: ExistingPolicy,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        for source in &registry.sources {
            if field_map_for_source(&source.source_id).is_none() {
                bail!("source {} has no field map", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.source_id.eq_ignore_ascii_case(source_id.trim()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub fn build_store(config: &SyncConfig, registry: &SourceRegistry) -> Result<Arc<dyn RecordStore>> {
    match config.store {
        StoreKind::File => Ok(Arc::new(JsonFileStore::new(config.data_dir.clone()))),
        StoreKind::Ninox => {
            let store = NinoxStore::new(NinoxConfig {
                base_url: config.ninox_base_url.clone(),
                api_key: config.ninox_api_key.clone(),
                tables: registry.tables.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("configuring ninox store")?;
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub screening_records: usize,
    pub included_records: usize,
    pub excluded_records: usize,
    pub index_entries: usize,
    pub upserts: usize,
    pub inserts: usize,
    pub updates: usize,
    pub written: usize,
    pub skipped_existing: usize,
    pub refreshed: usize,
    pub filtered: usize,
    pub duplicates_in_batch: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub duplicate_candidates: usize,
    pub payload_sha256: String,
    pub reports_dir: String,
    pub applied: bool,
}

pub struct ImportPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    store: Arc<dyn RecordStore>,
    archive: BatchArchive,
    reviewer: TitleReviewer,
}

impl ImportPipeline {
    pub fn new(config: SyncConfig, registry: SourceRegistry, store: Arc<dyn RecordStore>) -> Self {
        Self {
            archive: BatchArchive::new(config.artifacts_dir.clone()),
            reviewer: TitleReviewer::new(config.review_threshold),
            config,
            registry,
            store,
        }
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.workspace_root.join("sources.yaml")).await?;
        let store = build_store(&config, &registry)?;
        Ok(Self::new(config, registry, store))
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()?).await
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Imports one source. Diffs are only written to the store when `apply` is set;
    /// the reports are written either way.
    pub async fn run(&self, source_id: &str, apply: bool) -> Result<ImportSummary> {
        let source = self
            .registry
            .source(source_id)
            .ok_or_else(|| anyhow!("source {source_id} is not in the registry"))?;
        let map = field_map_for_source(&source.source_id)
            .ok_or_else(|| anyhow!("no field map registered for {}", source.source_id))?;

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let included_table = Partition::Included.table();
        let excluded_table = Partition::Excluded.table();

        let (batch, included, excluded) = tokio::try_join!(
            self.store
                .fetch(&source.screening_table, source.screening_filter.as_deref()),
            self.store.fetch(included_table, None),
            self.store.fetch(excluded_table, None),
        )
        .with_context(|| format!("fetching tables for {}", source.source_id))?;
        info!(
            source = %source.source_id,
            store = self.store.name(),
            screening = batch.len(),
            included = included.len(),
            excluded = excluded.len(),
            "fetched tables"
        );

        for (table, records) in [
            (source.screening_table.as_str(), &batch),
            (included_table, &included),
            (excluded_table, &excluded),
        ] {
            let archived = self.archive.archive(started_at, table, records).await?;
            if !archived.deduplicated {
                info!(table, path = %archived.relative_path.display(), "archived batch");
            }
        }

        let index = DedupIndex::build(&excluded, &included, &map.source_filter());
        info!(entries = index.len(), "built dedup index");

        let conversion = convert(&batch, &index, &map, source.existing_policy);
        for conflict in &conversion.conflicts {
            warn!(
                key = %conflict.key,
                field = %conflict.field,
                stored = %conflict.stored,
                observed = %conflict.observed,
                certainty = conflict.certainty.as_str(),
                "kept trusted value"
            );
        }
        let duplicates = self.reviewer.review(&conversion.upserts, &included);
        info!(
            upserts = conversion.upserts.len(),
            skipped = conversion.skipped_existing,
            refreshed = conversion.refreshed,
            filtered = conversion.filtered,
            conflicts = conversion.conflicts.len(),
            duplicate_candidates = duplicates.len(),
            "converted batch"
        );

        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        let payload_sha256 = report::write_payload_reports(&reports_dir, &conversion, &duplicates).await?;

        let written = if apply && !conversion.upserts.is_empty() {
            let written = self
                .store
                .upsert(included_table, &conversion.upserts)
                .await
                .with_context(|| format!("upserting {} records", conversion.upserts.len()))?;
            info!(written, "applied upserts");
            written
        } else {
            0
        };

        let inserts = conversion.upserts.iter().filter(|r| r.id == 0).count();
        let summary = ImportSummary {
            run_id,
            source_id: source.source_id.clone(),
            started_at,
            finished_at: Utc::now(),
            screening_records: batch.len(),
            included_records: included.len(),
            excluded_records: excluded.len(),
            index_entries: index.len(),
            upserts: conversion.upserts.len(),
            inserts,
            updates: conversion.upserts.len() - inserts,
            written,
            skipped_existing: conversion.skipped_existing,
            refreshed: conversion.refreshed,
            filtered: conversion.filtered,
            duplicates_in_batch: conversion.duplicates_in_batch,
            unchanged: conversion.unchanged,
            conflicts: conversion.conflicts.len(),
            duplicate_candidates: duplicates.len(),
            payload_sha256,
            reports_dir: reports_dir.display().to_string(),
            applied: apply,
        };
        report::write_summary(&summary).await?;

        Ok(summary)
    }

    /// Runs every enabled source in registry order, stopping at the first failure.
    pub async fn run_enabled(&self, apply: bool) -> Result<Vec<ImportSummary>> {
        let mut summaries = Vec::new();
        for source in self.registry.enabled() {
            summaries.push(self.run(&source.source_id, apply).await?);
        }
        Ok(summaries)
    }
}
