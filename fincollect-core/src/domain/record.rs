//! Raw records as returned by a source client, before validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::period;

/// Text cells that providers use to mean "no value".
const MISSING_MARKERS: &[&str] = &["", "na", "n/a", "np", "..", ".", "-", "nan", "null"];

/// A single cell of a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Null,
}

impl FieldValue {
    /// Build a value from provider text, mapping "not available" markers to `Null`.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if MISSING_MARKERS
            .iter()
            .any(|m| trimmed.eq_ignore_ascii_case(m))
        {
            FieldValue::Null
        } else {
            FieldValue::Text(trimmed.to_string())
        }
    }

    /// Build a value from a JSON cell.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Number(n) => n.as_f64().map_or(FieldValue::Null, FieldValue::Number),
            serde_json::Value::String(s) => FieldValue::from_text(s),
            serde_json::Value::Bool(b) => FieldValue::Text(b.to_string()),
            other => FieldValue::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view of the cell. Number-like text ("1,234.5", "3.1%") is accepted.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => parse_numeric(s),
            FieldValue::Null => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Timestamp view of the cell: epoch numbers or any accepted period string.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Number(n) => period::from_number(*n),
            FieldValue::Text(s) => period::parse_timestamp(s),
            FieldValue::Null => None,
        }
    }

    /// Render the cell as text regardless of its variant.
    pub fn render(&self) -> Option<String> {
        match self {
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Null => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::from_text(v)
    }
}

/// Parse a provider number, tolerating thousands separators, currency and percent signs.
pub fn parse_numeric(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .replace('\u{2212}', "-")
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Where a raw record came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// Provider-native observation: an opaque field map plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: Provenance,
}

impl RawRecord {
    pub fn new(source: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            fields: BTreeMap::new(),
            provenance: Provenance {
                source: source.into(),
                fetched_at,
            },
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn source(&self) -> &str {
        &self.provenance.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_markers_become_null() {
        for marker in ["", " ", "NA", "n/a", "NP", "..", ".", "-"] {
            assert!(FieldValue::from_text(marker).is_null(), "{marker:?}");
        }
        assert_eq!(
            FieldValue::from_text(" 4.1 "),
            FieldValue::Text("4.1".into())
        );
    }

    #[test]
    fn numeric_text_is_parsed() {
        assert_eq!(parse_numeric("1,234.5"), Some(1234.5));
        assert_eq!(parse_numeric("$12"), Some(12.0));
        assert_eq!(parse_numeric("3.1%"), Some(3.1));
        assert_eq!(parse_numeric("\u{2212}0.4"), Some(-0.4));
        assert_eq!(parse_numeric("abc"), None);
        assert_eq!(FieldValue::Number(f64::NAN).as_number(), None);
    }

    #[test]
    fn json_cells_map_to_field_values() {
        let v: serde_json::Value = serde_json::json!({"a": 1.5, "b": "x", "c": null});
        assert_eq!(FieldValue::from_json(&v["a"]), FieldValue::Number(1.5));
        assert_eq!(FieldValue::from_json(&v["b"]), FieldValue::Text("x".into()));
        assert!(FieldValue::from_json(&v["c"]).is_null());
    }
}
