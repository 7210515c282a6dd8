//! Moves between the included and excluded partitions.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::index::normalize_key;
use crate::CanonicalRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveReason {
    NotCovid,
    NotTrial,
    Duplicate,
    /// Screened back in: covid, trial and not a duplicate.
    Eligible,
}

/// Why an included record belongs in the excluded partition, if it does.
pub fn exclusion_reason(record: &CanonicalRecord) -> Option<MoveReason> {
    if record.field_str("is_covid") == "no" {
        return Some(MoveReason::NotCovid);
    }
    if record.field_str("is_trial") == "no"
        && matches!(record.field_str("is_observational").as_str(), "no" | "unclear" | "yes")
    {
        return Some(MoveReason::NotTrial);
    }
    if record.field_str("is_duplicate") == "true" {
        return Some(MoveReason::Duplicate);
    }
    None
}

pub fn is_restorable(record: &CanonicalRecord) -> bool {
    record.field_str("is_covid") == "yes"
        && record.field_str("is_trial") == "yes"
        && record.field_str("is_duplicate") == "false"
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionMove {
    /// Id in the partition the record leaves.
    pub from_id: u64,
    pub key: String,
    pub reason: MoveReason,
    /// Payload for the target partition; `id == 0` inserts.
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovePlan {
    pub moves: Vec<PartitionMove>,
    /// Candidates already present in the target partition.
    pub already_present: usize,
}

impl MovePlan {
    pub fn payload(&self) -> Vec<CanonicalRecord> {
        self.moves.iter().map(|m| m.record.clone()).collect()
    }

    pub fn from_ids(&self) -> Vec<u64> {
        self.moves.iter().map(|m| m.from_id).filter(|id| *id != 0).collect()
    }
}

/// Included records flagged as not covid, not a trial or duplicate. A record
/// whose key already exists in the excluded partition reuses that record's id.
pub fn plan_exclusions(included: &[CanonicalRecord], excluded: &[CanonicalRecord]) -> MovePlan {
    let excluded_ids: HashMap<String, u64> = excluded
        .iter()
        .map(|r| (normalize_key(&r.key()), r.id))
        .filter(|(key, _)| !key.is_empty())
        .collect();

    let mut plan = MovePlan::default();
    for record in included {
        let Some(reason) = exclusion_reason(record) else {
            continue;
        };
        let key = normalize_key(&record.key());
        let target_id = excluded_ids.get(&key).copied().unwrap_or(0);
        if target_id != 0 {
            plan.already_present += 1;
        }
        plan.moves.push(PartitionMove {
            from_id: record.id,
            key,
            reason,
            record: CanonicalRecord::new(target_id, record.fields.clone()),
        });
    }
    plan
}

/// Excluded records screened back in. Keys already in the included partition
/// are left alone; the excluded copy is kept.
pub fn plan_restores(excluded: &[CanonicalRecord], included: &[CanonicalRecord]) -> MovePlan {
    let included_keys: HashSet<String> = included
        .iter()
        .map(|r| normalize_key(&r.key()))
        .filter(|key| !key.is_empty())
        .collect();

    let mut plan = MovePlan::default();
    for record in excluded.iter().filter(|r| is_restorable(r)) {
        let key = normalize_key(&record.key());
        if included_keys.contains(&key) {
            plan.already_present += 1;
            continue;
        }
        plan.moves.push(PartitionMove {
            from_id: record.id,
            key,
            reason: MoveReason::Eligible,
            record: CanonicalRecord::new(0, record.fields.clone()),
        });
    }
    plan
}
