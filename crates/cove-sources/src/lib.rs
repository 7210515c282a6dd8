//! Field maps for the registries feeding the canonical store.
//!
//! Each provider is pure configuration over the generic converter in `cove-core`:
//! which source field feeds which canonical field, and how it is transformed.

use cove_core::normalize::{as_string, is_empty, to_int, to_iso_date, to_lower_case};
use cove_core::{FieldMap, FieldValue, SourceRecord, Transformed};

pub const CRATE_NAME: &str = "cove-sources";

pub const CLINICALTRIALS: &str = "clinicaltrials";
pub const ICTRP: &str = "ictrp";
pub const MEDRXIV: &str = "medrxiv";
pub const SWISSETHICS: &str = "swissethics";

pub const SOURCE_IDS: &[&str] = &[CLINICALTRIALS, ICTRP, MEDRXIV, SWISSETHICS];

pub fn field_map_for_source(source_id: &str) -> Option<FieldMap> {
    match source_id.trim().to_ascii_lowercase().as_str() {
        CLINICALTRIALS => Some(clinicaltrials_field_map()),
        ICTRP => Some(ictrp_field_map()),
        MEDRXIV => Some(medrxiv_field_map()),
        SWISSETHICS => Some(swissethics_field_map()),
        _ => None,
    }
}

fn lower(value: &str) -> Transformed {
    to_lower_case(value).into()
}

fn iso_date(value: &str) -> Transformed {
    to_iso_date(value).into()
}

fn integer(value: &str) -> Transformed {
    to_int(value).into()
}

/// Several `; `-separated countries collapse to `international`; repeats of one
/// country collapse to that country.
pub fn collapse_countries(value: &str) -> Transformed {
    if !value.contains(';') {
        return Transformed::prefilled(value);
    }

    let mut countries = value.split(';').map(str::trim).filter(|c| !c.is_empty());
    let Some(first) = countries.next() else {
        return Transformed::generated("");
    };
    if countries.all(|c| c == first) {
        Transformed::generated(first)
    } else {
        Transformed::generated("international")
    }
}

/// Maps clinicaltrials.gov masking descriptions onto the canonical blinding scale.
pub fn classify_blinding(masking: &str) -> Transformed {
    if masking.starts_with("None") {
        return Transformed::generated("none");
    }
    if ["Double", "Triple", "Quadruple"]
        .iter()
        .any(|prefix| masking.starts_with(prefix))
    {
        return Transformed::generated("double blind");
    }
    if masking.starts_with("Single") {
        if masking.contains("Outcomes") {
            return Transformed::generated("outcome only");
        }
        return Transformed::generated("single blind");
    }
    Transformed::prefilled("")
}

pub fn count_arms(arm_types: &str) -> Transformed {
    Transformed::generated(arm_types.matches("; ").count() as i64 + 1)
}

pub fn clinicaltrials_record_url(nct_id: &str) -> Transformed {
    Transformed::generated(format!("https://clinicaltrials.gov/ct2/show/record/{nct_id}"))
}

pub fn results_available(results_url: &str) -> Transformed {
    if results_url.is_empty() {
        Transformed::generated("no")
    } else {
        Transformed::generated("yes")
    }
}

fn compose_abstract(record: &SourceRecord) -> FieldValue {
    let mut sections = Vec::new();
    if !is_empty(record.field("brief_summary")) {
        sections.push(format!("Brief summary:\n{}", as_string(record.field("brief_summary"))));
    }
    if !is_empty(record.field("detailed_description")) {
        sections.push(format!(
            "Detailed descriptions:\n{}",
            as_string(record.field("detailed_description"))
        ));
    }
    FieldValue::from(sections.join("\n\n").trim().to_string())
}

pub fn clinicaltrials_field_map() -> FieldMap {
    FieldMap::new("clinicaltrials.gov", "nct_id")
        .skip_if(|r| matches!(r.field_str("cove_screening").as_str(), "1" | "3"))
        .static_value("is_covid", "yes")
        .static_value("is_trial", "yes")
        .static_value("is_observational", "no")
        .constant("entry_type", "registration")
        .track_with("url", "nct_id", clinicaltrials_record_url)
        .track("title", "official_title")
        .computed("abstract", compose_abstract)
        .constant("authors", "na")
        .constant("journal", "na")
        .constant("doi", "na")
        .track_with("status", "status", lower)
        .track_with("country", "location_country", collapse_countries)
        .track_with("randomized", "allocation", lower)
        .track_with("blinding", "masking", classify_blinding)
        .track_with("longitudinal_structure", "intervention_model", lower)
        .track_with("n_arms", "arm_group_arm_group_type", count_arms)
        .track_with("n_enrollment", "enrollment", integer)
        .track("population_condition", "condition")
        .track_with("population_gender", "gender", lower)
        .track("out_primary_measure", "primary_outcome_measure")
        .track("out_primary_desc", "primary_outcome_description")
        .track("out_primary_timeframe", "primary_outcome_time_frame")
        .track_with("start_date", "date_started", iso_date)
        .track_with("end_date", "date_completed", iso_date)
        .track_with("ipd_sharing", "patient_data_sharing_ipd", lower)
        .track("publication", "publications_pmid")
        .track("out_secondary_measure", "secondary_outcome_measure")
        .track("out_secondary_desc", "secondary_outcome_description")
        .track("out_secondary_timeframe", "secondary_outcome_time_frame")
}

/// ICTRP republishes clinicaltrials.gov entries under their NCT id.
pub fn ictrp_field_map() -> FieldMap {
    FieldMap::new("ICTRP", "TrialID")
        .alias("clinicaltrials.gov")
        .constant("entry_type", "registration")
        .track("url", "web address")
        .track("title", "Scientific title")
        .track("corresp_author_lastname", "Contact Lastname")
        .track("corresp_author_email", "Contact Email")
        .track_with("status", "Recruitment Status", lower)
        .track_with("status_date", "Last Refreshed On", iso_date)
        .track_with("country", "Countries", collapse_countries)
        .track_with("randomized", "Study design", lower)
        .track("population_condition", "condition")
        .track("intervention_name", "Intervention")
        .track("out_primary_measure", "Primary outcome")
        .track_with("start_date", "Date enrollement", iso_date)
        .track_with("results_available", "results url link", results_available)
        .track("inclusion_criteria", "Inclusion Criteria")
        .track("exclusion_criteria", "Exclusion Criteria")
}

pub fn medrxiv_field_map() -> FieldMap {
    FieldMap::new("medRxiv", "ID")
        .constant("entry_type", "preprint")
        .track("url", "rel_link")
        .track("title", "rel_title")
        .track("abstract", "rel_abs")
        .track("authors", "rel_authors")
        .track("doi", "rel_doi")
        .track_with("status_date", "rel_date", iso_date)
}

pub fn swissethics_field_map() -> FieldMap {
    FieldMap::new("Ethics committees (CH)", "Project ID")
        .static_value("is_trial", "yes")
        .static_field("extraction_comment", "Type of Project")
        .constant("entry_type", "ethics")
        .track("title", "Project Title")
        .track("authors", "Principal Investigator")
        .constant("country", "Switzerland")
        .track_with("status_date", "Date final decision", iso_date)
        .track("funding", "Sponsor")
}
