//! Lookup from composite key to the canonical record that already represents it.

use std::collections::{BTreeSet, HashMap};

use crate::{CanonicalRecord, Partition, SOURCE_FIELD};

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Provider names to index, compared case-insensitively. Empty admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    sources: BTreeSet<String>,
}

impl SourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sources: sources
                .into_iter()
                .map(|s| normalize_key(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn admits(&self, source: &str) -> bool {
        self.sources.is_empty() || self.sources.contains(&normalize_key(source))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexEntry<'a> {
    pub id: u64,
    pub partition: Partition,
    pub record: &'a CanonicalRecord,
}

#[derive(Debug, Default)]
pub struct DedupIndex<'a> {
    entries: HashMap<String, IndexEntry<'a>>,
}

impl<'a> DedupIndex<'a> {
    /// Indexes both partitions. Excluded records go in first so that an included
    /// record for the same key always takes the slot.
    pub fn build(
        excluded: &'a [CanonicalRecord],
        included: &'a [CanonicalRecord],
        filter: &SourceFilter,
    ) -> Self {
        let mut index = Self::default();

        for record in excluded {
            if filter.admits(&record.field_str(SOURCE_FIELD)) {
                index.insert(record, Partition::Excluded);
            }
        }

        for record in included {
            if filter.admits(&record.field_str(SOURCE_FIELD)) {
                index.insert(record, Partition::Included);
            }
        }

        index
    }

    fn insert(&mut self, record: &'a CanonicalRecord, partition: Partition) {
        let key = normalize_key(&record.key());
        if key.is_empty() {
            return;
        }
        if let Some(existing) = self.entries.get(&key) {
            if existing.partition == Partition::Included {
                return;
            }
        }
        self.entries.insert(
            key,
            IndexEntry {
                id: record.id,
                partition,
                record,
            },
        );
    }

    /// Empty keys never match.
    pub fn lookup(&self, key: &str) -> Option<&IndexEntry<'a>> {
        let key = normalize_key(key);
        if key.is_empty() {
            return None;
        }
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fields, SOURCE_ID_FIELD};

    fn record(id: u64, source: &str, source_id: &str) -> CanonicalRecord {
        let mut fields = Fields::new();
        fields.insert(SOURCE_FIELD.into(), source.into());
        fields.insert(SOURCE_ID_FIELD.into(), source_id.into());
        CanonicalRecord::new(id, fields)
    }

    #[test]
    fn included_partition_wins_over_excluded() {
        let excluded = vec![record(7, "ICTRP", "ChiCTR2000029308")];
        let included = vec![record(3, "ictrp", "chictr2000029308")];
        let index = DedupIndex::build(&excluded, &included, &SourceFilter::all());

        let entry = index.lookup("ICTRP::ChiCTR2000029308").expect("indexed");
        assert_eq!(entry.partition, Partition::Included);
        assert_eq!(entry.id, 3);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn excluded_only_keys_are_still_indexed() {
        let excluded = vec![record(11, "acme", "T1")];
        let index = DedupIndex::build(&excluded, &[], &SourceFilter::all());

        let entry = index.lookup(" ACME::t1 ").expect("indexed");
        assert_eq!(entry.partition, Partition::Excluded);
        assert_eq!(entry.record.id, 11);
    }

    #[test]
    fn first_included_record_keeps_the_slot() {
        let included = vec![record(1, "medRxiv", "2020.03.01"), record(2, "medRxiv", "2020.03.01")];
        let index = DedupIndex::build(&[], &included, &SourceFilter::all());
        assert_eq!(index.lookup("medrxiv::2020.03.01").map(|e| e.id), Some(1));
    }

    #[test]
    fn source_filter_limits_indexed_providers() {
        let included = vec![
            record(1, "clinicaltrials.gov", "NCT04280705"),
            record(2, "ICTRP", "ChiCTR2000029308"),
        ];
        let filter = SourceFilter::new(["Clinicaltrials.gov"]);
        let index = DedupIndex::build(&[], &included, &filter);

        assert!(index.lookup("clinicaltrials.gov::nct04280705").is_some());
        assert!(index.lookup("ictrp::chictr2000029308").is_none());
    }

    #[test]
    fn empty_keys_never_match() {
        let included = vec![record(1, "", ""), record(2, " ", "")];
        let index = DedupIndex::build(&[], &included, &SourceFilter::all());
        assert!(index.is_empty());
        assert!(index.lookup("").is_none());
        assert!(index.lookup("   ").is_none());
    }
}
