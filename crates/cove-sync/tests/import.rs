use std::path::Path;
use std::sync::Arc;

use cove_core::{CanonicalRecord, FieldValue, Fields, PREFILLED_AUTOMATICALLY};
use cove_storage::{JsonFileStore, RecordStore};
use cove_sync::{report_recent_markdown, ImportPipeline, MoveDirection, SourceRegistry, SyncConfig};
use tempfile::tempdir;

const REGISTRY: &str = r#"
sources:
  - source_id: ictrp
    screening_table: ictrp
    screening_filter: '{"fields":{"cove_screening":"include"}}'
  - source_id: swissethics
    screening_table: swissethics
    existing_policy: refresh_unreviewed
"#;

fn record(pairs: &[(&str, &str)]) -> CanonicalRecord {
    let fields: Fields = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
        .collect();
    CanonicalRecord::new(0, fields)
}

async fn pipeline(root: &Path) -> (ImportPipeline, Arc<JsonFileStore>) {
    let config = SyncConfig::for_workspace(root);
    let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
    let registry = SourceRegistry::parse(REGISTRY).expect("registry");
    (ImportPipeline::new(config, registry, store.clone()), store)
}

async fn seed_ictrp(store: &JsonFileStore) {
    store
        .upsert(
            "ictrp",
            &[
                record(&[
                    ("TrialID", "ChiCTR2000029308"),
                    ("Scientific title", "A randomized, open-label study of lopinavir-ritonavir"),
                    ("Recruitment Status", "Recruiting"),
                    ("Countries", "China"),
                    ("Date enrollement", "January 18, 2020"),
                    ("cove_screening", "include"),
                ]),
                record(&[
                    ("TrialID", "IRCT20200317046797N1"),
                    ("Scientific title", "Hydroxychloroquine prophylaxis in health care workers"),
                    ("Recruitment Status", "Not Recruiting"),
                    ("Countries", "Iran; Iran"),
                    ("cove_screening", "include"),
                ]),
                record(&[
                    ("TrialID", "NCT04280705"),
                    ("Scientific title", "Adaptive COVID-19 Treatment Trial"),
                    ("cove_screening", "include"),
                ]),
                record(&[("TrialID", "DRKS00021208"), ("cove_screening", "exclude")]),
            ],
        )
        .await
        .expect("seed screening table");
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, store) = pipeline(dir.path()).await;
    seed_ictrp(&store).await;

    let summary = pipeline.run("ictrp", false).await.expect("dry run");

    assert_eq!(summary.screening_records, 3);
    assert_eq!(summary.upserts, 3);
    assert_eq!(summary.written, 0);
    assert!(!summary.applied);
    assert!(store.fetch("covebasic", None).await.expect("fetch").is_empty());

    let reports = Path::new(&summary.reports_dir);
    for file in ["upserts.json", "conflicts.json", "duplicates.json", "summary.md", "summary.json"] {
        assert!(reports.join(file).is_file(), "{file}");
    }
    let payload: Vec<CanonicalRecord> =
        serde_json::from_str(&std::fs::read_to_string(reports.join("upserts.json")).expect("read"))
            .expect("parse");
    assert_eq!(payload.len(), 3);
}

#[tokio::test]
async fn applied_import_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, store) = pipeline(dir.path()).await;
    seed_ictrp(&store).await;

    let first = pipeline.run("ictrp", true).await.expect("first run");
    assert_eq!(first.inserts, 3);
    assert_eq!(first.written, 3);

    let stored = store.fetch("covebasic", None).await.expect("fetch");
    assert_eq!(stored.len(), 3);
    let iran = stored
        .iter()
        .find(|r| r.field_str("source_id") == "IRCT20200317046797N1")
        .expect("iran trial");
    assert_eq!(iran.field_str("source"), "ICTRP");
    assert_eq!(iran.field_str("country"), "Iran");
    assert_eq!(iran.field_str("country_certainty"), "generated");
    assert_eq!(iran.field_str("status"), "not recruiting");
    assert_eq!(iran.field_str("review_status"), PREFILLED_AUTOMATICALLY);

    let second = pipeline.run("ictrp", true).await.expect("second run");
    assert_eq!(second.upserts, 0);
    assert_eq!(second.skipped_existing, 3);
    assert_eq!(second.written, 0);
    assert_eq!(store.fetch("covebasic", None).await.expect("fetch").len(), 3);
}

#[tokio::test]
async fn excluded_and_cross_registry_hits_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, store) = pipeline(dir.path()).await;
    seed_ictrp(&store).await;
    store
        .upsert(
            "exclusions",
            &[record(&[("source", "ICTRP"), ("source_id", "chictr2000029308")])],
        )
        .await
        .expect("seed exclusions");
    store
        .upsert(
            "covebasic",
            &[record(&[
                ("source", "clinicaltrials.gov"),
                ("source_id", "NCT04280705"),
                ("title", "Adaptive COVID-19 Treatment Trial (ACTT)"),
            ])],
        )
        .await
        .expect("seed included");

    let summary = pipeline.run("ictrp", true).await.expect("run");

    assert_eq!(summary.skipped_existing, 2);
    assert_eq!(summary.inserts, 1);
    let stored = store.fetch("covebasic", None).await.expect("fetch");
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.field_str("source_id") != "ChiCTR2000029308"));
}

#[tokio::test]
async fn human_corrections_survive_a_refresh() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, store) = pipeline(dir.path()).await;
    store
        .upsert(
            "covebasic",
            &[record(&[
                ("source", "Ethics committees (CH)"),
                ("source_id", "2020-00566"),
                ("review_status", PREFILLED_AUTOMATICALLY),
                ("title", "Swiss COVID-19 hospital cohort"),
                ("title_certainty", "human"),
                ("status_date", "2020-03-01"),
                ("status_date_certainty", "prefilled"),
            ])],
        )
        .await
        .expect("seed included");
    store
        .upsert(
            "swissethics",
            &[record(&[
                ("Project ID", "2020-00566"),
                ("Project Title", "COVID-19 Kohorte"),
                ("Date final decision", "16.03.20"),
                ("Type of Project", "Observational"),
            ])],
        )
        .await
        .expect("seed screening table");

    let summary = pipeline.run("swissethics", true).await.expect("run");

    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.updates, 1);
    assert_eq!(summary.conflicts, 1);

    let stored = store.fetch("covebasic", None).await.expect("fetch");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].field_str("title"), "Swiss COVID-19 hospital cohort");
    assert_eq!(stored[0].field_str("title_certainty"), "human");
    assert_eq!(stored[0].field_str("status_date"), "2020-03-16");
    assert_eq!(stored[0].field_str("status_date_certainty"), "generated");
    assert_eq!(stored[0].field_str("extraction_comment"), "Observational");

    let conflicts: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(Path::new(&summary.reports_dir).join("conflicts.json")).expect("read"),
    )
    .expect("parse");
    assert_eq!(conflicts[0]["field"], "title");
    assert_eq!(conflicts[0]["certainty"], "human");
}

#[tokio::test]
async fn run_enabled_and_recent_report_cover_every_source() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, store) = pipeline(dir.path()).await;
    seed_ictrp(&store).await;

    let summaries = pipeline.run_enabled(false).await.expect("runs");
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[1].screening_records, 0);

    let digest = report_recent_markdown(5, Some(dir.path().to_path_buf())).expect("digest");
    assert!(digest.contains("ictrp"));
    assert!(digest.contains("swissethics"));
    assert!(digest.contains("dry run"));

    assert!(pipeline.run("pubmed", false).await.is_err());
}

#[tokio::test]
async fn ictrp_refresh_leaves_clinicaltrials_records_to_their_own_source() {
    let dir = tempdir().expect("tempdir");
    let config = SyncConfig::for_workspace(dir.path());
    let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
    let registry = SourceRegistry::parse(
        "sources:\n  - source_id: ictrp\n    screening_table: ictrp\n    existing_policy: refresh_unreviewed\n",
    )
    .expect("registry");
    let pipeline = ImportPipeline::new(config, registry, store.clone());
    store
        .upsert(
            "covebasic",
            &[record(&[
                ("source", "clinicaltrials.gov"),
                ("source_id", "NCT04280705"),
                ("review_status", PREFILLED_AUTOMATICALLY),
            ])],
        )
        .await
        .expect("seed included");
    store
        .upsert("ictrp", &[record(&[("TrialID", "NCT04280705"), ("Scientific title", "ACTT")])])
        .await
        .expect("seed screening table");

    let summary = pipeline.run("ictrp", true).await.expect("run");

    assert_eq!(summary.refreshed, 0);
    assert_eq!(summary.skipped_existing, 1);
    let stored = store.fetch("covebasic", None).await.expect("fetch");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].field_str("source"), "clinicaltrials.gov");
}

#[tokio::test]
async fn flagged_records_move_to_exclusions_and_back() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, store) = pipeline(dir.path()).await;
    store
        .upsert(
            "exclusions",
            &[record(&[("source", "ICTRP"), ("source_id", "A1"), ("is_covid", "unclear")])],
        )
        .await
        .expect("seed exclusions");
    store
        .upsert(
            "covebasic",
            &[
                record(&[("source", "ICTRP"), ("source_id", "A1"), ("is_covid", "no")]),
                record(&[("source", "ICTRP"), ("source_id", "A2"), ("is_duplicate", "true")]),
                record(&[("source", "ICTRP"), ("source_id", "A3"), ("is_covid", "yes")]),
            ],
        )
        .await
        .expect("seed included");

    let dry = pipeline
        .move_partitions(MoveDirection::ToExclusions, false)
        .await
        .expect("dry run");
    assert_eq!(dry.moves, 2);
    assert_eq!(dry.written, 0);
    assert!(Path::new(&dry.reports_dir).join("moves.json").is_file());
    assert_eq!(store.fetch("covebasic", None).await.expect("fetch").len(), 3);

    let applied = pipeline
        .move_partitions(MoveDirection::ToExclusions, true)
        .await
        .expect("apply");
    assert_eq!(applied.already_present, 1);
    assert_eq!(applied.written, 2);
    assert_eq!(applied.deleted, 2);

    let included = store.fetch("covebasic", None).await.expect("fetch");
    assert_eq!(included.len(), 1);
    assert_eq!(included[0].field_str("source_id"), "A3");
    let excluded = store.fetch("exclusions", None).await.expect("fetch");
    assert_eq!(excluded.len(), 2);
    let a1 = excluded.iter().find(|r| r.field_str("source_id") == "A1").expect("a1");
    assert_eq!(a1.id, 1);
    assert_eq!(a1.field_str("is_covid"), "no");

    store
        .upsert(
            "exclusions",
            &[record(&[
                ("source", "ICTRP"),
                ("source_id", "A4"),
                ("is_covid", "yes"),
                ("is_trial", "yes"),
                ("is_duplicate", "false"),
            ])],
        )
        .await
        .expect("seed eligible");
    let restored = pipeline
        .move_partitions(MoveDirection::ToIncluded, true)
        .await
        .expect("restore");
    assert_eq!(restored.moves, 1);
    assert_eq!(restored.deleted, 0);
    assert_eq!(store.fetch("covebasic", None).await.expect("fetch").len(), 2);
}
