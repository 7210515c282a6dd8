//! Canonical record model and the provenance-aware reconciliation engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub mod convert;
pub mod index;
pub mod maintenance;
pub mod normalize;
pub mod reconcile;

pub use convert::{convert, Conversion, ExistingPolicy, FieldMap, FieldMapping, ValueSource};
pub use index::{normalize_key, DedupIndex, IndexEntry, SourceFilter};
pub use maintenance::{
    exclusion_reason, is_restorable, plan_exclusions, plan_restores, MovePlan, MoveReason, PartitionMove,
};
pub use reconcile::{reconcile_field, FieldConflict, FieldOutcome, RecordDiff, Transform, Transformed};

pub const CRATE_NAME: &str = "cove-core";

pub const SOURCE_FIELD: &str = "source";
pub const SOURCE_ID_FIELD: &str = "source_id";
pub const REVIEW_STATUS_FIELD: &str = "review_status";

/// Review status stamped on every record the importer writes.
pub const PREFILLED_AUTOMATICALLY: &str = "prefilled automatically";

/// Scalar value stored in a record field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn empty() -> Self {
        FieldValue::Text(String::new())
    }

    /// Converts a decoded JSON value; `null` is treated as absent and nested
    /// values are kept as their JSON text.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::Bool(b) => Some(FieldValue::Bool(b)),
            JsonValue::Number(n) => Some(match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => FieldValue::Float(n.as_f64().unwrap_or_default()),
            }),
            JsonValue::String(s) => Some(FieldValue::Text(s)),
            other => Some(FieldValue::Text(other.to_string())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v:.0}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(FieldValue::from_json(value).unwrap_or_else(FieldValue::empty))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

fn deserialize_fields<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Fields, D::Error> {
    let raw = Option::<BTreeMap<String, JsonValue>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| FieldValue::from_json(value).map(|v| (name, v)))
        .collect())
}

/// Provenance marker paired with every tracked field (`<field>_certainty`).
///
/// Ordered along the trust chain; `Verified` and `Human` block automatic overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Certainty {
    Prefilled,
    Generated,
    Verified,
    Human,
}

impl Certainty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Certainty::Prefilled => "prefilled",
            Certainty::Generated => "generated",
            Certainty::Verified => "verified",
            Certainty::Human => "human",
        }
    }

    /// Reads a stored marker. Empty means "never checked"; markers this crate
    /// does not know are handled like `prefilled`.
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim() {
            "" => None,
            "generated" => Some(Certainty::Generated),
            "verified" => Some(Certainty::Verified),
            "human" => Some(Certainty::Human),
            _ => Some(Certainty::Prefilled),
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, Certainty::Verified | Certainty::Human)
    }
}

impl fmt::Display for Certainty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn certainty_field(field: &str) -> String {
    format!("{field}_certainty")
}

/// The two sub-stores a canonical record can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Included,
    Excluded,
}

impl Partition {
    pub fn table(&self) -> &'static str {
        match self {
            Partition::Included => "covebasic",
            Partition::Excluded => "exclusions",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Included => f.write_str("included"),
            Partition::Excluded => f.write_str("excluded"),
        }
    }
}

/// `source::source_id`, lowercased and trimmed. Degrades to whichever half is
/// present, or to the empty string when both are missing.
pub fn composite_key(source: &str, source_id: &str) -> String {
    let source = source.trim().to_lowercase();
    let source_id = source_id.trim().to_lowercase();
    match (source.is_empty(), source_id.is_empty()) {
        (true, true) => String::new(),
        (false, true) => source,
        (true, false) => source_id,
        (false, false) => format!("{source}::{source_id}"),
    }
}

fn is_zero(id: &u64) -> bool {
    *id == 0
}

/// A record in the canonical store or in a source screening table.
///
/// `id == 0` means the record has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(default, deserialize_with = "deserialize_fields")]
    pub fields: Fields,
}

/// Source records share the canonical shape but use the provider's field names.
pub type SourceRecord = CanonicalRecord;

impl CanonicalRecord {
    pub fn new(id: u64, fields: Fields) -> Self {
        Self {
            id,
            fields,
            ..Default::default()
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// String rendering of a field, empty when missing.
    pub fn field_str(&self, name: &str) -> String {
        normalize::as_string(self.field(name))
    }

    pub fn certainty(&self, field: &str) -> Option<Certainty> {
        Certainty::from_marker(&self.field_str(&certainty_field(field)))
    }

    pub fn key(&self) -> String {
        composite_key(&self.field_str(SOURCE_FIELD), &self.field_str(SOURCE_ID_FIELD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_normalizes_case_and_whitespace() {
        assert_eq!(composite_key("CTGOV", " NCT123 "), composite_key("ctgov", "nct123"));
        assert_eq!(composite_key("CTGOV", " NCT123 "), "ctgov::nct123");
    }

    #[test]
    fn composite_key_degrades_to_present_half() {
        assert_eq!(composite_key("ICTRP", ""), "ictrp");
        assert_eq!(composite_key(" ", "ISRCTN1"), "isrctn1");
        assert_eq!(composite_key("", "  "), "");
    }

    #[test]
    fn record_deserializes_ninox_shape_and_drops_nulls() {
        let record: CanonicalRecord = serde_json::from_str(
            r#"{"id": 42, "sequence": 7, "createdAt": "2020-04-01T10:00:00",
                "fields": {"source": "ICTRP", "source_id": "ChiCTR2000029308",
                           "n_enrollment": 120, "ratio": 0.5, "is_trial": true, "doi": null}}"#,
        )
        .expect("decode record");

        assert_eq!(record.id, 42);
        assert_eq!(record.sequence, Some(7));
        assert_eq!(record.field("n_enrollment"), Some(&FieldValue::Integer(120)));
        assert_eq!(record.field("ratio"), Some(&FieldValue::Float(0.5)));
        assert_eq!(record.field_str("is_trial"), "true");
        assert!(record.field("doi").is_none());
        assert_eq!(record.key(), "ictrp::chictr2000029308");
    }

    #[test]
    fn new_records_serialize_without_id() {
        let mut fields = Fields::new();
        fields.insert("title".into(), "Hydroxychloroquine trial".into());
        let json = serde_json::to_value(CanonicalRecord::new(0, fields)).expect("encode");
        assert_eq!(json, serde_json::json!({"fields": {"title": "Hydroxychloroquine trial"}}));
    }

    #[test]
    fn unknown_certainty_markers_are_treated_as_prefilled() {
        assert_eq!(Certainty::from_marker(""), None);
        assert_eq!(Certainty::from_marker("human"), Some(Certainty::Human));
        assert_eq!(Certainty::from_marker("imported"), Some(Certainty::Prefilled));
        assert!(Certainty::Verified.is_protected());
        assert!(!Certainty::Generated.is_protected());
    }
}
