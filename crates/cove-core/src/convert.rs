//! Generic source-to-canonical conversion driven by a declarative field map.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::index::{DedupIndex, SourceFilter};
use crate::reconcile::{FieldConflict, RecordDiff, Transform, Transformed};
use crate::{
    composite_key, FieldValue, Fields, Partition, SourceRecord, PREFILLED_AUTOMATICALLY, REVIEW_STATUS_FIELD,
    SOURCE_FIELD, SOURCE_ID_FIELD,
};

/// Where a canonical field takes its raw value from.
#[derive(Clone)]
pub enum ValueSource {
    Field(String),
    Constant(FieldValue),
    Computed(Arc<dyn Fn(&SourceRecord) -> FieldValue + Send + Sync>),
}

impl ValueSource {
    pub fn resolve(&self, record: &SourceRecord) -> Option<FieldValue> {
        match self {
            ValueSource::Field(name) => record.field(name).cloned(),
            ValueSource::Constant(value) => Some(value.clone()),
            ValueSource::Computed(compute) => Some(compute(record)),
        }
    }
}

impl fmt::Debug for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Field(name) => f.debug_tuple("Field").field(name).finish(),
            ValueSource::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            ValueSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Clone)]
pub struct FieldMapping {
    pub canonical: String,
    pub source: ValueSource,
    pub transform: Option<Transform>,
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("canonical", &self.canonical)
            .field("source", &self.source)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// What to do when a source record is already represented in the canonical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingPolicy {
    #[default]
    Skip,
    /// Re-reconcile included records found under this source's own key that are
    /// still marked `prefilled automatically`; skip every other hit.
    RefreshUnreviewed,
}

/// Static per-source configuration: how one provider's records map onto the
/// canonical schema.
#[derive(Clone)]
pub struct FieldMap {
    source_name: String,
    id_field: String,
    aliases: Vec<String>,
    static_fields: Vec<(String, ValueSource)>,
    mappings: Vec<FieldMapping>,
    skip_if: Option<Arc<dyn Fn(&SourceRecord) -> bool + Send + Sync>>,
}

impl FieldMap {
    pub fn new(source_name: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            id_field: id_field.into(),
            aliases: Vec::new(),
            static_fields: Vec::new(),
            mappings: Vec::new(),
            skip_if: None,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    /// Another provider that publishes the same identifiers (e.g. NCT ids).
    pub fn alias(mut self, source_name: impl Into<String>) -> Self {
        self.aliases.push(source_name.into());
        self
    }

    pub fn static_value(mut self, canonical: &str, value: impl Into<FieldValue>) -> Self {
        self.static_fields
            .push((canonical.to_string(), ValueSource::Constant(value.into())));
        self
    }

    pub fn static_field(mut self, canonical: &str, source_field: &str) -> Self {
        self.static_fields
            .push((canonical.to_string(), ValueSource::Field(source_field.to_string())));
        self
    }

    pub fn track(self, canonical: &str, source_field: &str) -> Self {
        self.push(canonical, ValueSource::Field(source_field.to_string()), None)
    }

    pub fn track_with<F>(self, canonical: &str, source_field: &str, transform: F) -> Self
    where
        F: Fn(&str) -> Transformed + Send + Sync + 'static,
    {
        self.push(
            canonical,
            ValueSource::Field(source_field.to_string()),
            Some(Arc::new(transform)),
        )
    }

    pub fn constant(self, canonical: &str, value: impl Into<FieldValue>) -> Self {
        self.push(canonical, ValueSource::Constant(value.into()), None)
    }

    pub fn computed<F>(self, canonical: &str, compute: F) -> Self
    where
        F: Fn(&SourceRecord) -> FieldValue + Send + Sync + 'static,
    {
        self.push(canonical, ValueSource::Computed(Arc::new(compute)), None)
    }

    pub fn skip_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&SourceRecord) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    fn push(mut self, canonical: &str, source: ValueSource, transform: Option<Transform>) -> Self {
        self.mappings.push(FieldMapping {
            canonical: canonical.to_string(),
            source,
            transform,
        });
        self
    }

    /// Providers whose canonical records this map must be checked against.
    pub fn source_filter(&self) -> SourceFilter {
        SourceFilter::new(std::iter::once(&self.source_name).chain(self.aliases.iter()))
    }

    pub fn source_id_of(&self, record: &SourceRecord) -> String {
        record.field_str(&self.id_field).trim().to_string()
    }

    /// Own key first, then one key per alias provider.
    pub fn candidate_keys(&self, source_id: &str) -> Vec<String> {
        std::iter::once(&self.source_name)
            .chain(self.aliases.iter())
            .map(|source| composite_key(source, source_id))
            .collect()
    }

    fn skips(&self, record: &SourceRecord) -> bool {
        self.skip_if.as_ref().is_some_and(|predicate| predicate(record))
    }
}

impl fmt::Debug for FieldMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMap")
            .field("source_name", &self.source_name)
            .field("id_field", &self.id_field)
            .field("aliases", &self.aliases)
            .field("static_fields", &self.static_fields)
            .field("mappings", &self.mappings)
            .field("skip_if", &self.skip_if.is_some())
            .finish()
    }
}

/// Result of converting one source batch.
#[derive(Debug, Clone, Default)]
pub struct Conversion {
    /// Diff records to upsert; `id == 0` inserts.
    pub upserts: Vec<crate::CanonicalRecord>,
    pub conflicts: Vec<FieldConflict>,
    pub skipped_existing: usize,
    pub refreshed: usize,
    pub filtered: usize,
    pub duplicates_in_batch: usize,
    pub unchanged: usize,
}

pub fn convert(
    source_records: &[SourceRecord],
    index: &DedupIndex<'_>,
    map: &FieldMap,
    policy: ExistingPolicy,
) -> Conversion {
    let empty = Fields::new();
    let mut out = Conversion::default();
    let mut seen = HashSet::new();

    for record in source_records {
        if map.skips(record) {
            out.filtered += 1;
            continue;
        }

        let source_id = map.source_id_of(record);
        let keys = map.candidate_keys(&source_id);
        let key = keys[0].clone();

        if !key.is_empty() && !seen.insert(key.clone()) {
            out.duplicates_in_batch += 1;
            continue;
        }

        // alias hits belong to another provider and are never refreshed from this one
        let hit = keys
            .iter()
            .enumerate()
            .find_map(|(i, k)| index.lookup(k).map(|entry| (i == 0, entry)));
        let (id, current) = match hit {
            Some((true, entry))
                if policy == ExistingPolicy::RefreshUnreviewed
                    && entry.partition == Partition::Included
                    && entry.record.field_str(REVIEW_STATUS_FIELD) == PREFILLED_AUTOMATICALLY =>
            {
                out.refreshed += 1;
                (entry.id, &entry.record.fields)
            }
            Some(_) => {
                out.skipped_existing += 1;
                continue;
            }
            None => (0, &empty),
        };

        let mut diff = RecordDiff::new(id, key);
        if id == 0 {
            diff.set_static(SOURCE_FIELD, FieldValue::from(map.source_name.as_str()));
            diff.set_static(SOURCE_ID_FIELD, FieldValue::from(source_id));
            diff.set_static(REVIEW_STATUS_FIELD, FieldValue::from(PREFILLED_AUTOMATICALLY));
        }
        for (canonical, source) in &map.static_fields {
            let value = source.resolve(record).unwrap_or_else(FieldValue::empty);
            diff.set_static(canonical.as_str(), value);
        }

        for mapping in &map.mappings {
            let raw = mapping.source.resolve(record);
            if let Some(conflict) =
                diff.reconcile(current, &mapping.canonical, raw.as_ref(), mapping.transform.as_ref())
            {
                out.conflicts.push(conflict);
            }
        }

        if diff.is_updated() {
            out.upserts.push(diff.into_record());
        } else {
            out.unchanged += 1;
        }
    }

    out
}
