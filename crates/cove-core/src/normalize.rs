//! Scalar coercion and loose date parsing for registry values.

use chrono::{Datelike, NaiveDate};

use crate::FieldValue;

/// Canonical string rendering; absent values render as `""`.
pub fn as_string(value: Option<&FieldValue>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}

pub fn is_empty(value: Option<&FieldValue>) -> bool {
    as_string(value).is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Day,
    Month,
}

#[derive(Debug, Clone, Copy)]
struct DatePattern {
    format: &'static str,
    precision: Precision,
    four_digit_year: bool,
}

const fn pattern(format: &'static str, precision: Precision, four_digit_year: bool) -> DatePattern {
    DatePattern {
        format,
        precision,
        four_digit_year,
    }
}

// Tried in order, first match wins.
const DATE_PATTERNS: &[DatePattern] = &[
    pattern("%B %d, %Y", Precision::Day, true),
    pattern("%d. %b %y", Precision::Day, false),
    pattern("%d.%m.%y", Precision::Day, false),
    pattern("%m/%d/%y", Precision::Day, false),
    pattern("%B %Y", Precision::Month, true),
    pattern("%B %y", Precision::Month, false),
    pattern("%b %Y", Precision::Month, true),
    pattern("%b %y", Precision::Month, false),
];

const GERMAN_MONTHS: &[(&str, &str)] = &[("Mär", "Mar"), ("Mai", "May"), ("Okt", "Oct"), ("Dez", "Dec")];

fn parse_with(value: &str, pattern: &DatePattern) -> Option<NaiveDate> {
    let date = match pattern.precision {
        Precision::Day => NaiveDate::parse_from_str(value, pattern.format).ok()?,
        Precision::Month => {
            NaiveDate::parse_from_str(&format!("1 {value}"), &format!("%d {}", pattern.format)).ok()?
        }
    };
    // chrono reads `%Y` with any width, so "Mar 20" would otherwise land in year 20
    if pattern.four_digit_year && !(1000..=9999).contains(&date.year()) {
        return None;
    }
    Some(date)
}

/// Parses the date formats registries emit and renders them as `YYYY-MM-DD`,
/// or `YYYY-MM` when the matched format carries no day.
///
/// Unparsable input comes back unchanged with `matched == false`.
pub fn to_iso_date(raw: &str) -> (String, bool) {
    let mut value = raw.trim().to_string();
    for (german, english) in GERMAN_MONTHS {
        value = value.replace(german, english);
    }

    for pattern in DATE_PATTERNS {
        if let Some(date) = parse_with(&value, pattern) {
            let rendered = match pattern.precision {
                Precision::Day => date.format("%Y-%m-%d").to_string(),
                Precision::Month => date.format("%Y-%m").to_string(),
            };
            return (rendered, true);
        }
    }

    (raw.to_string(), false)
}

pub fn to_lower_case(raw: &str) -> (String, bool) {
    (raw.to_lowercase(), false)
}

/// Best effort integer parse; anything unparsable becomes `0`.
pub fn to_int(raw: &str) -> (i64, bool) {
    (raw.trim().parse().unwrap_or(0), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_render_canonically() {
        assert_eq!(as_string(Some(&FieldValue::Integer(1200))), "1200");
        assert_eq!(as_string(Some(&FieldValue::Float(41.6))), "42");
        assert_eq!(as_string(Some(&FieldValue::Bool(false))), "false");
        assert_eq!(as_string(Some(&FieldValue::from("Recruiting"))), "Recruiting");
        assert_eq!(as_string(None), "");
        assert!(is_empty(None));
        assert!(is_empty(Some(&FieldValue::empty())));
        assert!(!is_empty(Some(&FieldValue::Integer(0))));
    }

    #[test]
    fn long_month_dates_keep_day_precision() {
        assert_eq!(to_iso_date("March 16, 2020"), ("2020-03-16".to_string(), true));
        assert_eq!(to_iso_date("April 2, 2020"), ("2020-04-02".to_string(), true));
    }

    #[test]
    fn numeric_dates_parse_day_first_with_dots_and_month_first_with_slashes() {
        assert_eq!(to_iso_date("16.03.20"), ("2020-03-16".to_string(), true));
        assert_eq!(to_iso_date("04/01/20"), ("2020-04-01".to_string(), true));
    }

    #[test]
    fn abbreviated_day_month_year() {
        assert_eq!(to_iso_date("2. Apr 20"), ("2020-04-02".to_string(), true));
        assert_eq!(to_iso_date("24. Dez 19"), ("2019-12-24".to_string(), true));
    }

    #[test]
    fn month_only_dates_keep_month_precision() {
        assert_eq!(to_iso_date("Mär 20"), ("2020-03".to_string(), true));
        assert_eq!(to_iso_date("May 2020"), ("2020-05".to_string(), true));
        assert_eq!(to_iso_date("Okt 2021"), ("2021-10".to_string(), true));
        assert_eq!(to_iso_date("December 2020"), ("2020-12".to_string(), true));
    }

    #[test]
    fn unparsable_dates_are_preserved_verbatim() {
        assert_eq!(to_iso_date("not a date"), ("not a date".to_string(), false));
        assert_eq!(to_iso_date("2020-13-45"), ("2020-13-45".to_string(), false));
        assert_eq!(to_iso_date(""), (String::new(), false));
    }

    #[test]
    fn integer_parse_failures_become_zero() {
        assert_eq!(to_int("250"), (250, false));
        assert_eq!(to_int(" 12 "), (12, false));
        assert_eq!(to_int("approx. 300"), (0, false));
        assert_eq!(to_lower_case("Not yet recruiting"), ("not yet recruiting".to_string(), false));
    }
}
