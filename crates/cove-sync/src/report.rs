use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cove_core::Conversion;
use cove_storage::BatchArchive;
use tokio::fs;

use crate::review::DuplicateCandidate;
use crate::ImportSummary;

pub const SUMMARY_JSON: &str = "summary.json";

/// Writes `upserts.json`, `conflicts.json`, `duplicates.json` into `reports_dir`
/// and returns the sha256 of the upsert payload.
pub(crate) async fn write_payload_reports(
    reports_dir: &Path,
    conversion: &Conversion,
    duplicates: &[DuplicateCandidate],
) -> Result<String> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let payload = serde_json::to_vec_pretty(&conversion.upserts).context("serializing upserts")?;
    let payload_sha256 = BatchArchive::sha256_hex(&payload);
    write_file(&reports_dir.join("upserts.json"), &payload).await?;

    let conflicts = serde_json::to_vec_pretty(&conversion.conflicts).context("serializing conflicts")?;
    write_file(&reports_dir.join("conflicts.json"), &conflicts).await?;

    let duplicates = serde_json::to_vec_pretty(duplicates).context("serializing duplicate candidates")?;
    write_file(&reports_dir.join("duplicates.json"), &duplicates).await?;

    Ok(payload_sha256)
}

pub(crate) async fn write_summary(summary: &ImportSummary) -> Result<()> {
    let reports_dir = PathBuf::from(&summary.reports_dir);
    let json = serde_json::to_vec_pretty(summary).context("serializing import summary")?;
    write_file(&reports_dir.join(SUMMARY_JSON), &json).await?;
    write_file(&reports_dir.join("summary.md"), summary_markdown(summary).as_bytes()).await
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub fn summary_markdown(summary: &ImportSummary) -> String {
    let mode = if summary.applied { "applied" } else { "dry run" };
    format!(
        "# Import `{}` ({mode})\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Screening records: {}\n\
         - Included / excluded records: {} / {}\n\
         - Index entries: {}\n\n\
         ## Outcome\n\
         - Upserts: {} ({} new, {} updates)\n\
         - Written: {}\n\
         - Skipped existing: {}\n\
         - Refreshed: {}\n\
         - Filtered: {}\n\
         - Duplicates in batch: {}\n\
         - Unchanged: {}\n\
         - Conflicts: {}\n\
         - Duplicate candidates: {}\n\
         - Payload sha256: `{}`\n",
        summary.source_id,
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.screening_records,
        summary.included_records,
        summary.excluded_records,
        summary.index_entries,
        summary.upserts,
        summary.inserts,
        summary.updates,
        summary.written,
        summary.skipped_existing,
        summary.refreshed,
        summary.filtered,
        summary.duplicates_in_batch,
        summary.unchanged,
        summary.conflicts,
        summary.duplicate_candidates,
        summary.payload_sha256,
    )
}

/// Digest of the latest `runs` import reports under `<root>/reports`, newest first.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");

    let mut summaries = Vec::new();
    let entries = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join(SUMMARY_JSON);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let summary: ImportSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Cove Import Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No import runs recorded.".to_string());
    }
    for summary in summaries.into_iter().take(runs.max(1)) {
        let mode = if summary.applied { "applied" } else { "dry run" };
        lines.push(format!("## Run `{}` ({}, {mode})", summary.run_id, summary.source_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- upserts: {} ({} new, {} updates)",
            summary.upserts, summary.inserts, summary.updates
        ));
        lines.push(format!("- skipped existing: {}", summary.skipped_existing));
        lines.push(format!("- conflicts: {}", summary.conflicts));
        lines.push(format!("- duplicate candidates: {}", summary.duplicate_candidates));
        lines.push(format!("- reports: `{}`", summary.reports_dir));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
