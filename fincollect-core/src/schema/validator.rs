//! Record validation against a compiled [`SchemaContract`].
//!
//! Rules run in a fixed order and never short-circuit, so a record reports
//! every violation it has:
//!
//! 1. required-field presence (`Null` counts as missing)
//! 2. type conformance
//! 3. range and sanity rules on fields that parsed
//! 4. cross-field checks, which only add issues

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::contract::{CrossCheck, FieldKind, RangeRule, SchemaContract};
use super::mapping::FieldMapping;
use crate::domain::{DatasetType, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Required,
    Type,
    Range,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rule::Required => "required",
            Rule::Type => "type",
            Rule::Range => "range",
        })
    }
}

/// One failed rule on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub rule: Rule,
    pub reason: String,
}

impl Violation {
    fn new(field: &str, rule: Rule, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            rule,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.rule, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub record: RawRecord,
    pub passed: bool,
    pub violations: Vec<Violation>,
    /// Cross-field findings. Reported, never failing.
    pub issues: Vec<String>,
}

/// An item's batch contained records that failed validation. Never retried.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{} of {total_records} records failed validation; first: {}", .violations.len(), first_violation(.violations))]
pub struct ValidationError {
    pub total_records: usize,
    /// `(record index, violations)` for every failing record.
    pub violations: Vec<(usize, Vec<Violation>)>,
}

fn first_violation(violations: &[(usize, Vec<Violation>)]) -> String {
    violations
        .first()
        .and_then(|(idx, v)| v.first().map(|v| format!("record {idx}: {v}")))
        .unwrap_or_default()
}

impl ValidationError {
    pub fn violation_count(&self) -> usize {
        self.violations.iter().map(|(_, v)| v.len()).sum()
    }
}

/// A contract paired with a provider's field mapping.
#[derive(Debug, Clone)]
pub struct Validator {
    contract: SchemaContract,
    mapping: FieldMapping,
}

impl Validator {
    pub fn new(contract: SchemaContract, mapping: FieldMapping) -> Self {
        Self { contract, mapping }
    }

    /// Built-in contract with an identity mapping.
    pub fn builtin(dataset_type: DatasetType) -> Self {
        Self::new(
            SchemaContract::builtin(dataset_type).clone(),
            FieldMapping::identity(),
        )
    }

    pub fn contract(&self) -> &SchemaContract {
        &self.contract
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn validate(&self, record: RawRecord) -> ValidationResult {
        check(&self.contract, &self.mapping, record)
    }
}

/// Validate a record against the built-in contract for `dataset_type`.
pub fn validate(record: RawRecord, dataset_type: DatasetType) -> ValidationResult {
    check(
        SchemaContract::builtin(dataset_type),
        &FieldMapping::identity(),
        record,
    )
}

fn check(contract: &SchemaContract, mapping: &FieldMapping, record: RawRecord) -> ValidationResult {
    let mut violations = Vec::new();
    let mut issues = Vec::new();

    for rule in contract.required_fields() {
        let present = mapping
            .lookup(&record, &rule.name)
            .is_some_and(|v| !v.is_null());
        if !present {
            let reason = match mapping.resolve(&rule.name) {
                Some(key) if key != rule.name => format!("missing (provider key '{key}')"),
                Some(_) => "missing".to_string(),
                None => "no mapping for required field".to_string(),
            };
            violations.push(Violation::new(&rule.name, Rule::Required, reason));
        }
    }

    let mut numbers: HashMap<&str, f64> = HashMap::new();
    for rule in contract.fields() {
        let Some(value) = mapping.lookup(&record, &rule.name).filter(|v| !v.is_null()) else {
            continue;
        };
        match rule.kind {
            FieldKind::Number => match value.as_number() {
                Some(n) => {
                    numbers.insert(rule.name.as_str(), n);
                }
                None => violations.push(Violation::new(
                    &rule.name,
                    Rule::Type,
                    format!("expected a number, got {:?}", value.render().unwrap_or_default()),
                )),
            },
            FieldKind::Timestamp => {
                if value.as_timestamp().is_none() {
                    violations.push(Violation::new(
                        &rule.name,
                        Rule::Type,
                        format!("unparsable timestamp {:?}", value.render().unwrap_or_default()),
                    ));
                }
            }
            FieldKind::Text => {}
        }
    }

    for rule in contract.ranges() {
        check_range(rule, &numbers, &mut violations);
    }

    for cross in contract.cross_checks() {
        match cross {
            CrossCheck::EpsConsistency { tolerance } => {
                if let Some(issue) = eps_consistency(&numbers, *tolerance) {
                    issues.push(issue);
                }
            }
        }
    }

    ValidationResult {
        record,
        passed: violations.is_empty(),
        violations,
        issues,
    }
}

fn check_range(rule: &RangeRule, numbers: &HashMap<&str, f64>, out: &mut Vec<Violation>) {
    match rule {
        RangeRule::OhlcEnvelope => {
            let (Some(&low), Some(&high)) = (numbers.get("low"), numbers.get("high")) else {
                return;
            };
            if low > high {
                // The envelope is meaningless once inverted.
                out.push(Violation::new(
                    "low",
                    Rule::Range,
                    format!("low {low} exceeds high {high}"),
                ));
                return;
            }
            for name in ["open", "close"] {
                if let Some(&v) = numbers.get(name) {
                    if v < low || v > high {
                        out.push(Violation::new(
                            name,
                            Rule::Range,
                            format!("{name} {v} outside [{low}, {high}]"),
                        ));
                    }
                }
            }
        }
        RangeRule::Positive { field } => {
            if let Some(&v) = numbers.get(field.as_str()) {
                if v <= 0.0 {
                    out.push(Violation::new(field, Rule::Range, format!("{v} is not positive")));
                }
            }
        }
        RangeRule::NonNegative { field } => {
            if let Some(&v) = numbers.get(field.as_str()) {
                if v < 0.0 {
                    out.push(Violation::new(field, Rule::Range, format!("{v} is negative")));
                }
            }
        }
        RangeRule::Between { field, min, max } => {
            if let Some(&v) = numbers.get(field.as_str()) {
                if v < *min || v > *max {
                    out.push(Violation::new(
                        field,
                        Rule::Range,
                        format!("{v} outside [{min}, {max}]"),
                    ));
                }
            }
        }
    }
}

fn eps_consistency(numbers: &HashMap<&str, f64>, tolerance: f64) -> Option<String> {
    let eps = *numbers.get("eps")?;
    let net_income = *numbers.get("net_income")?;
    let shares = *numbers.get("shares_outstanding")?;
    if shares <= 0.0 {
        return None;
    }
    let implied = net_income / shares;
    let scale = implied.abs().max(f64::EPSILON);
    ((eps - implied).abs() / scale > tolerance).then(|| {
        format!(
            "eps {eps} differs from net_income/shares_outstanding {implied:.4} by more than {:.0}%",
            tolerance * 100.0
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldValue;
    use chrono::Utc;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> RawRecord {
        RawRecord::new("test", Utc::now())
            .with("timestamp", "2024-01-02")
            .with("open", open)
            .with("high", high)
            .with("low", low)
            .with("close", close)
            .with("volume", volume)
    }

    #[test]
    fn valid_bar_passes() {
        let r = validate(bar(100.0, 105.0, 99.0, 104.0, 1_000.0), DatasetType::Ohlcv);
        assert!(r.passed, "{:?}", r.violations);
        assert!(r.issues.is_empty());
    }

    #[test]
    fn inverted_low_high_is_a_single_violation() {
        let r = validate(bar(105.0, 100.0, 110.0, 104.0, 1_000.0), DatasetType::Ohlcv);
        assert!(!r.passed);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].field, "low");
        assert_eq!(r.violations[0].rule, Rule::Range);
    }

    #[test]
    fn close_outside_envelope_is_flagged() {
        let r = validate(bar(100.0, 105.0, 99.0, 120.0, 1_000.0), DatasetType::Ohlcv);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].field, "close");
    }

    #[test]
    fn negative_volume_and_price_are_flagged() {
        let r = validate(bar(-1.0, 105.0, -2.0, 104.0, -5.0), DatasetType::Ohlcv);
        let fields: Vec<&str> = r.violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"volume"));
        assert!(fields.contains(&"open"));
        assert!(fields.contains(&"low"));
    }

    #[test]
    fn null_counts_as_missing() {
        let record = bar(100.0, 105.0, 99.0, 104.0, 1_000.0).with("volume", FieldValue::Null);
        let r = validate(record, DatasetType::Ohlcv);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].field, "volume");
        assert_eq!(r.violations[0].rule, Rule::Required);
    }

    #[test]
    fn every_missing_field_is_reported() {
        let record = RawRecord::new("test", Utc::now()).with("timestamp", "2024-01-02");
        let r = validate(record, DatasetType::Ohlcv);
        assert_eq!(r.violations.len(), 5);
        assert!(r.violations.iter().all(|v| v.rule == Rule::Required));
    }

    #[test]
    fn type_failures_and_number_like_text() {
        let record = RawRecord::new("abs", Utc::now())
            .with("timestamp", "Mar Qtr 2025")
            .with("value", "1,234.5")
            .with("indicator_code", "CPI");
        assert!(validate(record, DatasetType::EconomicIndicator).passed);

        let record = RawRecord::new("abs", Utc::now())
            .with("timestamp", "sometime")
            .with("value", "lots")
            .with("indicator_code", "CPI");
        let r = validate(record, DatasetType::EconomicIndicator);
        assert_eq!(r.violations.len(), 2);
        assert!(r.violations.iter().all(|v| v.rule == Rule::Type));
    }

    #[test]
    fn eps_mismatch_is_an_issue_not_a_violation() {
        let record = RawRecord::new("filings", Utc::now())
            .with("timestamp", "2024-Q4")
            .with("eps", 2.0)
            .with("net_income", 1_000.0)
            .with("shares_outstanding", 1_000.0);
        let r = validate(record, DatasetType::Fundamentals);
        assert!(r.passed);
        assert_eq!(r.issues.len(), 1);
        assert!(r.issues[0].contains("eps"));
    }

    #[test]
    fn percent_bounds_apply_when_configured() {
        let contract = SchemaContract::builtin(DatasetType::EconomicIndicator)
            .clone()
            .with_percent_bounds("value")
            .unwrap();
        let v = Validator::new(contract, FieldMapping::identity());
        let record = RawRecord::new("fred", Utc::now())
            .with("timestamp", "2024-05")
            .with("value", "1500%")
            .with("indicator_code", "UNRATE");
        let r = v.validate(record);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].rule, Rule::Range);
    }

    #[test]
    fn mapped_provider_keys_are_used() {
        let mapping = FieldMapping::identity()
            .with_field("timestamp", "date")
            .with_field("value", "VALUE")
            .with_field("indicator_code", "series_id");
        let v = Validator::new(
            SchemaContract::builtin(DatasetType::EconomicIndicator).clone(),
            mapping,
        );
        let record = RawRecord::new("fred", Utc::now())
            .with("date", "2024-05-01")
            .with("VALUE", 3.9);
        let r = v.validate(record);
        assert_eq!(r.violations.len(), 1);
        assert_eq!(r.violations[0].field, "indicator_code");
        assert!(r.violations[0].reason.contains("series_id"));
    }

    #[test]
    fn validation_error_message_names_first_violation() {
        let err = ValidationError {
            total_records: 3,
            violations: vec![(
                1,
                vec![Violation::new("low", Rule::Range, "low 110 exceeds high 100")],
            )],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("1 of 3 records failed validation"));
        assert!(msg.contains("record 1: low [range]"));
        assert_eq!(err.violation_count(), 1);
    }
}
