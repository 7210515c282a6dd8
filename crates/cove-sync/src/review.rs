use cove_core::{CanonicalRecord, SOURCE_FIELD};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.92;

/// A new record whose title resembles an included record from another source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub key: String,
    pub title: String,
    pub existing_id: u64,
    pub existing_key: String,
    pub existing_title: String,
    pub score: f64,
}

/// Flags cross-registry near-duplicates for a reviewer. Nothing is merged.
#[derive(Debug, Clone, Copy)]
pub struct TitleReviewer {
    threshold: f64,
}

impl Default for TitleReviewer {
    fn default() -> Self {
        Self::new(DEFAULT_REVIEW_THRESHOLD)
    }
}

impl TitleReviewer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Lowercased words of alphanumerics, single-space separated.
    pub fn normalize_title(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = Self::normalize_title(a);
        let b = Self::normalize_title(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a.replace(' ', "") == b.replace(' ', "") {
            return 1.0;
        }
        jaro_winkler(&a, &b)
    }

    /// Compares each pending insert against included records of other sources.
    pub fn review(&self, upserts: &[CanonicalRecord], included: &[CanonicalRecord]) -> Vec<DuplicateCandidate> {
        let mut candidates = Vec::new();

        for record in upserts.iter().filter(|r| r.id == 0) {
            let title = record.field_str("title");
            if title.trim().is_empty() {
                continue;
            }
            let source = record.field_str(SOURCE_FIELD).to_lowercase();

            for existing in included {
                if existing.field_str(SOURCE_FIELD).to_lowercase() == source {
                    continue;
                }
                let existing_title = existing.field_str("title");
                let score = self.similarity(&title, &existing_title);
                if score >= self.threshold {
                    candidates.push(DuplicateCandidate {
                        key: record.key(),
                        title: title.clone(),
                        existing_id: existing.id,
                        existing_key: existing.key(),
                        existing_title,
                        score,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates
    }
}
