//! Certainty-aware field merge.
//!
//! Reconciliation reads an immutable snapshot of a record's fields and writes
//! into a [`RecordDiff`] that only carries what changed, ready for a partial upsert.

use std::sync::Arc;

use serde::Serialize;

use crate::normalize::as_string;
use crate::{certainty_field, CanonicalRecord, Certainty, FieldValue, Fields};

/// Output of a field transform. `generated` tags an accepted value as derived
/// rather than copied from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub value: FieldValue,
    pub generated: bool,
}

impl Transformed {
    pub fn prefilled(value: impl Into<FieldValue>) -> Self {
        Self {
            value: value.into(),
            generated: false,
        }
    }

    pub fn generated(value: impl Into<FieldValue>) -> Self {
        Self {
            value: value.into(),
            generated: true,
        }
    }
}

impl From<(String, bool)> for Transformed {
    fn from((value, generated): (String, bool)) -> Self {
        Self {
            value: FieldValue::Text(value),
            generated,
        }
    }
}

impl From<(i64, bool)> for Transformed {
    fn from((value, generated): (i64, bool)) -> Self {
        Self {
            value: FieldValue::Integer(value),
            generated,
        }
    }
}

pub type Transform = Arc<dyn Fn(&str) -> Transformed + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    /// Stored value already matches; the field stays out of the diff.
    Unchanged,
    Accepted { value: FieldValue, certainty: Certainty },
    /// A verified or human value disagrees with the source. The field stays out
    /// of the diff and needs a human re-check.
    Conflict {
        stored: String,
        observed: String,
        certainty: Certainty,
    },
}

pub fn reconcile_field(
    current: &Fields,
    field: &str,
    raw: Option<&FieldValue>,
    transform: Option<&Transform>,
) -> FieldOutcome {
    let (value, generated) = match transform {
        Some(transform) => {
            let out = transform(&as_string(raw));
            (out.value, out.generated)
        }
        None => (raw.cloned().unwrap_or_else(FieldValue::empty), false),
    };

    let observed = value.to_string();
    let stored = as_string(current.get(field));
    let certainty = Certainty::from_marker(&as_string(current.get(&certainty_field(field))));

    if observed.is_empty() {
        return match certainty {
            None | Some(Certainty::Generated) => FieldOutcome::Accepted {
                value,
                certainty: Certainty::Prefilled,
            },
            // an empty observation never clears a prefilled value
            Some(Certainty::Prefilled) => FieldOutcome::Unchanged,
            Some(_) if stored.is_empty() => FieldOutcome::Unchanged,
            Some(protected) => FieldOutcome::Conflict {
                stored,
                observed,
                certainty: protected,
            },
        };
    }

    if observed == stored {
        return FieldOutcome::Unchanged;
    }

    match certainty {
        Some(protected) if protected.is_protected() => FieldOutcome::Conflict {
            stored,
            observed,
            certainty: protected,
        },
        _ => FieldOutcome::Accepted {
            value,
            certainty: if generated {
                Certainty::Generated
            } else {
                Certainty::Prefilled
            },
        },
    }
}

/// A rejected overwrite of a trusted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub key: String,
    pub field: String,
    pub stored: String,
    pub observed: String,
    pub certainty: Certainty,
}

/// Run-scoped change set for one canonical record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDiff {
    id: u64,
    key: String,
    fields: Fields,
    updated: bool,
}

impl RecordDiff {
    pub fn new(id: u64, key: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            fields: Fields::new(),
            updated: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// True once any tracked field was written.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Writes a field that carries no certainty marker. Does not mark the diff updated.
    pub fn set_static(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn reconcile(
        &mut self,
        current: &Fields,
        field: &str,
        raw: Option<&FieldValue>,
        transform: Option<&Transform>,
    ) -> Option<FieldConflict> {
        match reconcile_field(current, field, raw, transform) {
            FieldOutcome::Accepted { value, certainty } => {
                self.fields.insert(field.to_string(), value);
                self.fields
                    .insert(certainty_field(field), FieldValue::from(certainty.as_str()));
                self.updated = true;
                None
            }
            FieldOutcome::Unchanged => {
                self.clear(field);
                None
            }
            FieldOutcome::Conflict {
                stored,
                observed,
                certainty,
            } => {
                self.clear(field);
                Some(FieldConflict {
                    key: self.key.clone(),
                    field: field.to_string(),
                    stored,
                    observed,
                    certainty,
                })
            }
        }
    }

    fn clear(&mut self, field: &str) {
        self.fields.remove(field);
        self.fields.remove(&certainty_field(field));
    }

    pub fn into_record(self) -> CanonicalRecord {
        CanonicalRecord::new(self.id, self.fields)
    }
}
