use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cove_core::{plan_exclusions, plan_restores, Partition};
use cove_storage::BatchArchive;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::ImportPipeline;

pub const MAINTENANCE_JSON: &str = "maintenance.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    /// Flagged included records go to `exclusions` and are deleted from `covebasic`.
    ToExclusions,
    /// Eligible excluded records are inserted into `covebasic`.
    ToIncluded,
}

impl MoveDirection {
    fn tables(self) -> (&'static str, &'static str) {
        match self {
            MoveDirection::ToExclusions => (Partition::Included.table(), Partition::Excluded.table()),
            MoveDirection::ToIncluded => (Partition::Excluded.table(), Partition::Included.table()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveSummary {
    pub run_id: Uuid,
    pub direction: MoveDirection,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub included_records: usize,
    pub excluded_records: usize,
    pub moves: usize,
    pub already_present: usize,
    pub written: usize,
    pub deleted: usize,
    pub payload_sha256: String,
    pub reports_dir: String,
    pub applied: bool,
}

impl ImportPipeline {
    /// Moves records between the partitions by their screening flags. Like
    /// imports, the store is only written with `apply`.
    pub async fn move_partitions(&self, direction: MoveDirection, apply: bool) -> Result<MoveSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let (from_table, to_table) = direction.tables();
        let included_table = Partition::Included.table();
        let excluded_table = Partition::Excluded.table();

        let (included, excluded) = tokio::try_join!(
            self.store.fetch(included_table, None),
            self.store.fetch(excluded_table, None),
        )
        .context("fetching canonical partitions")?;
        for (table, records) in [(included_table, &included), (excluded_table, &excluded)] {
            self.archive.archive(started_at, table, records).await?;
        }

        let plan = match direction {
            MoveDirection::ToExclusions => plan_exclusions(&included, &excluded),
            MoveDirection::ToIncluded => plan_restores(&excluded, &included),
        };
        info!(
            ?direction,
            moves = plan.moves.len(),
            already_present = plan.already_present,
            "planned partition moves"
        );

        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let moves = serde_json::to_vec_pretty(&plan.moves).context("serializing partition moves")?;
        let payload_sha256 = BatchArchive::sha256_hex(&moves);
        let moves_path = reports_dir.join("moves.json");
        fs::write(&moves_path, &moves)
            .await
            .with_context(|| format!("writing {}", moves_path.display()))?;

        let (mut written, mut deleted) = (0, 0);
        if apply && !plan.moves.is_empty() {
            written = self
                .store
                .upsert(to_table, &plan.payload())
                .await
                .with_context(|| format!("upserting {} records into {to_table}", plan.moves.len()))?;
            if direction == MoveDirection::ToExclusions {
                deleted = self
                    .store
                    .delete(from_table, &plan.from_ids())
                    .await
                    .with_context(|| format!("deleting moved records from {from_table}"))?;
            }
            info!(written, deleted, "applied partition moves");
        }

        let summary = MoveSummary {
            run_id,
            direction,
            started_at,
            finished_at: Utc::now(),
            included_records: included.len(),
            excluded_records: excluded.len(),
            moves: plan.moves.len(),
            already_present: plan.already_present,
            written,
            deleted,
            payload_sha256,
            reports_dir: reports_dir.display().to_string(),
            applied: apply,
        };
        let summary_path = reports_dir.join(MAINTENANCE_JSON);
        let json = serde_json::to_vec_pretty(&summary).context("serializing move summary")?;
        fs::write(&summary_path, json)
            .await
            .with_context(|| format!("writing {}", summary_path.display()))?;

        Ok(summary)
    }
}
