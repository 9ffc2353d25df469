//! Timestamp and reporting-period parsing.
//!
//! Every accepted string maps to exactly one UTC instant. Period strings map to
//! the first instant of the period they name:
//!
//! | input                          | instant                  |
//! |--------------------------------|--------------------------|
//! | `2025-03-14T09:30:00Z`         | as given, converted to UTC |
//! | `2025-03-14 09:30:00`          | naive, taken as UTC      |
//! | `2025-03-14`, `2025/03/14`     | midnight UTC             |
//! | `2025-03`, `Mar 2025`, `June 2025` | first of the month   |
//! | `2025-Q1`, `Q1 2025`           | first day of the quarter |
//! | `Mar Qtr 2025`, `mar quarter 2025` | first day of the quarter ending in that month |
//! | `2025`                         | 1 January                |
//!
//! Day-first or month-first slash dates (`03/04/2025`) are rejected as ambiguous.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::domain::Frequency;

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

const NAIVE_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

/// Values above this magnitude are treated as epoch milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Parse a timestamp or period string into a UTC instant.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return midnight(date);
        }
    }

    parse_period(s).or_else(|| epoch_text(s))
}

/// Timestamp from a numeric cell. Whole numbers are read the way their text
/// would be, so `2025` is a year in both forms and larger values are epochs.
pub fn from_number(value: f64) -> Option<DateTime<Utc>> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        return parse_timestamp(&(value as i64).to_string());
    }
    from_epoch(value)
}

fn epoch_text(s: &str) -> Option<DateTime<Utc>> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

/// Parse a non-ISO reporting period ("Mar Qtr 2025", "May 2025", "2025-Q2", "2025").
pub fn parse_period(text: &str) -> Option<DateTime<Utc>> {
    let s = text.trim();
    let tokens: Vec<&str> = s.split_whitespace().collect();

    match tokens.as_slice() {
        [year] => parse_compact(year),
        [month, year] => {
            let year = parse_year(year)?;
            if let Some(q) = parse_quarter_token(month) {
                return quarter_start(year, q);
            }
            first_of_month(year, month_from_name(month)?)
        }
        [month, word, year]
            if word.eq_ignore_ascii_case("qtr") || word.eq_ignore_ascii_case("quarter") =>
        {
            let year = parse_year(year)?;
            let month = month_from_name(month)?;
            if month % 3 != 0 {
                return None;
            }
            first_of_month(year, month - 2)
        }
        _ => None,
    }
}

/// Convert epoch seconds (or milliseconds, for large values) to a UTC instant.
pub fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() > EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

/// Classify a period string by the frequency it implies.
pub fn detect_frequency(period_text: &str) -> Frequency {
    let lower = period_text.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return Frequency::Unknown;
    }
    if lower.contains("qtr") || lower.contains("quarter") || quarter_in_compact(&lower) {
        return Frequency::Quarterly;
    }
    if lower.split_whitespace().any(|t| month_from_name(t).is_some()) {
        return Frequency::Monthly;
    }
    if parse_year(&lower).is_some() {
        return Frequency::Annual;
    }
    Frequency::Unknown
}

/// Month number for a full or abbreviated (at least three letters) English month name.
pub fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.trim().trim_end_matches('.').to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(lower.as_str()))
        .map(|i| i as u32 + 1)
}

fn parse_compact(token: &str) -> Option<DateTime<Utc>> {
    if let Some(year) = parse_year(token) {
        return first_of_month(year, 1);
    }
    let (year, rest) = token.split_once('-').or_else(|| {
        // "2025Q1"
        let idx = token.find(['Q', 'q'])?;
        Some((&token[..idx], &token[idx..]))
    })?;
    let year = parse_year(year)?;
    if let Some(q) = parse_quarter_token(rest) {
        return quarter_start(year, q);
    }
    let month: u32 = rest.parse().ok()?;
    if rest.len() != 2 {
        return None;
    }
    first_of_month(year, month)
}

fn quarter_in_compact(lower: &str) -> bool {
    lower
        .split(['-', ' '])
        .any(|t| parse_quarter_token(t).is_some())
}

fn parse_quarter_token(token: &str) -> Option<u32> {
    let rest = token.strip_prefix(['Q', 'q'])?;
    let q: u32 = rest.parse().ok()?;
    (1..=4).contains(&q).then_some(q)
}

fn parse_year(token: &str) -> Option<i32> {
    if token.len() != 4 || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn quarter_start(year: i32, quarter: u32) -> Option<DateTime<Utc>> {
    first_of_month(year, (quarter - 1) * 3 + 1)
}

fn first_of_month(year: i32, month: u32) -> Option<DateTime<Utc>> {
    midnight(NaiveDate::from_ymd_opt(year, month, 1)?)
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc())
}
