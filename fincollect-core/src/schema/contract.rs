//! Schema contracts: required fields, field kinds and range rules per dataset type.
//!
//! A contract is declared once (built-in defaults or a TOML [`ContractSpec`]) and
//! compiled into a [`SchemaContract`] that is reused for every record validated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::domain::DatasetType;

/// Lower bound of the sanity range for percentage-valued fields.
pub const PERCENT_MIN: f64 = -100.0;
/// Upper bound of the sanity range for percentage-valued fields.
pub const PERCENT_MAX: f64 = 1000.0;

/// Fundamentals cross-check tolerance: relative gap between reported and implied EPS.
pub const DEFAULT_EPS_TOLERANCE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Number,
    Text,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldRule {
    fn new(name: &str, kind: FieldKind, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required,
        }
    }
}

/// Range and sanity rules, evaluated on fields that parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RangeRule {
    /// `low <= high`, then `low <= open <= high` and `low <= close <= high`.
    OhlcEnvelope,
    Positive { field: String },
    NonNegative { field: String },
    Between { field: String, min: f64, max: f64 },
}

/// Cross-field checks. These flag issues; they never fail a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum CrossCheck {
    /// `eps` vs `net_income / shares_outstanding`.
    EpsConsistency { tolerance: f64 },
}

/// Declarative form of a contract, as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub dataset_type: DatasetType,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub ranges: Vec<RangeRule>,
    #[serde(default)]
    pub cross_checks: Vec<CrossCheck>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("field '{0}' declared more than once")]
    DuplicateField(String),

    #[error("range rule references unknown field '{0}'")]
    UnknownField(String),

    #[error("range rule on '{0}' requires a number field")]
    NotNumeric(String),

    #[error("contract parse error: {0}")]
    Parse(String),
}

/// A compiled contract. Cheap to share by reference across validation calls.
#[derive(Debug, Clone)]
pub struct SchemaContract {
    dataset_type: DatasetType,
    fields: Vec<FieldRule>,
    index: HashMap<String, usize>,
    ranges: Vec<RangeRule>,
    cross_checks: Vec<CrossCheck>,
}

impl SchemaContract {
    /// Compile a declarative spec, checking that every rule references a known field.
    pub fn compile(spec: ContractSpec) -> Result<Self, ContractError> {
        let mut index = HashMap::new();
        for (i, field) in spec.fields.iter().enumerate() {
            if index.insert(field.name.clone(), i).is_some() {
                return Err(ContractError::DuplicateField(field.name.clone()));
            }
        }

        let contract = Self {
            dataset_type: spec.dataset_type,
            fields: spec.fields,
            index,
            ranges: spec.ranges,
            cross_checks: spec.cross_checks,
        };

        for rule in &contract.ranges {
            for name in rule.referenced_fields() {
                contract.require_number(name)?;
            }
        }
        if contract
            .cross_checks
            .iter()
            .any(|c| matches!(c, CrossCheck::EpsConsistency { .. }))
        {
            for name in ["eps", "net_income", "shares_outstanding"] {
                contract.require_number(name)?;
            }
        }

        Ok(contract)
    }

    /// Parse and compile a TOML contract spec.
    pub fn from_toml(content: &str) -> Result<Self, ContractError> {
        let spec: ContractSpec =
            toml::from_str(content).map_err(|e| ContractError::Parse(e.to_string()))?;
        Self::compile(spec)
    }

    /// The built-in contract for a dataset type, compiled once per process.
    pub fn builtin(dataset_type: DatasetType) -> &'static SchemaContract {
        static BUILTINS: OnceLock<Vec<SchemaContract>> = OnceLock::new();
        let all = BUILTINS.get_or_init(|| DatasetType::ALL.into_iter().map(builtin_contract).collect());
        let pos = DatasetType::ALL
            .iter()
            .position(|dt| *dt == dataset_type)
            .unwrap_or(0);
        &all[pos]
    }

    /// Add the percentage sanity bounds to a number field.
    pub fn with_percent_bounds(mut self, field: &str) -> Result<Self, ContractError> {
        self.require_number(field)?;
        self.ranges.push(RangeRule::Between {
            field: field.to_string(),
            min: PERCENT_MIN,
            max: PERCENT_MAX,
        });
        Ok(self)
    }

    pub fn dataset_type(&self) -> DatasetType {
        self.dataset_type
    }

    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldRule> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Names of every number field, in declaration order.
    pub fn number_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Number)
            .map(|f| f.name.as_str())
    }

    pub fn ranges(&self) -> &[RangeRule] {
        &self.ranges
    }

    pub fn cross_checks(&self) -> &[CrossCheck] {
        &self.cross_checks
    }

    fn require_number(&self, name: &str) -> Result<(), ContractError> {
        match self.field(name) {
            None => Err(ContractError::UnknownField(name.to_string())),
            Some(f) if f.kind != FieldKind::Number => Err(ContractError::NotNumeric(name.to_string())),
            Some(_) => Ok(()),
        }
    }
}

impl RangeRule {
    fn referenced_fields(&self) -> Vec<&str> {
        match self {
            RangeRule::OhlcEnvelope => vec!["open", "high", "low", "close"],
            RangeRule::Positive { field }
            | RangeRule::NonNegative { field }
            | RangeRule::Between { field, .. } => vec![field.as_str()],
        }
    }
}

fn builtin_contract(dataset_type: DatasetType) -> SchemaContract {
    use FieldKind::{Number, Text, Timestamp};

    let (fields, ranges, cross_checks) = match dataset_type {
        DatasetType::Ohlcv => (
            vec![
                FieldRule::new("timestamp", Timestamp, true),
                FieldRule::new("open", Number, true),
                FieldRule::new("high", Number, true),
                FieldRule::new("low", Number, true),
                FieldRule::new("close", Number, true),
                FieldRule::new("volume", Number, true),
                FieldRule::new("adj_close", Number, false),
                FieldRule::new("entity_id", Text, false),
            ],
            vec![
                RangeRule::OhlcEnvelope,
                RangeRule::Positive { field: "open".into() },
                RangeRule::Positive { field: "high".into() },
                RangeRule::Positive { field: "low".into() },
                RangeRule::Positive { field: "close".into() },
                RangeRule::NonNegative { field: "volume".into() },
            ],
            vec![],
        ),
        DatasetType::Fundamentals => (
            vec![
                FieldRule::new("timestamp", Timestamp, true),
                FieldRule::new("entity_id", Text, false),
                FieldRule::new("eps", Number, false),
                FieldRule::new("net_income", Number, false),
                FieldRule::new("shares_outstanding", Number, false),
                FieldRule::new("revenue", Number, false),
                FieldRule::new("total_assets", Number, false),
                FieldRule::new("total_liabilities", Number, false),
                FieldRule::new("market_cap", Number, false),
                FieldRule::new("pe_ratio", Number, false),
                FieldRule::new("dividend_yield", Number, false),
                FieldRule::new("book_value", Number, false),
            ],
            vec![
                RangeRule::NonNegative { field: "shares_outstanding".into() },
                RangeRule::NonNegative { field: "market_cap".into() },
            ],
            vec![CrossCheck::EpsConsistency {
                tolerance: DEFAULT_EPS_TOLERANCE,
            }],
        ),
        DatasetType::Event => (
            vec![
                FieldRule::new("timestamp", Timestamp, true),
                FieldRule::new("event_type", Text, true),
                FieldRule::new("entity_id", Text, false),
                FieldRule::new("value", Number, false),
            ],
            vec![],
            vec![],
        ),
        DatasetType::EconomicIndicator => (
            vec![
                FieldRule::new("timestamp", Timestamp, true),
                FieldRule::new("value", Number, true),
                FieldRule::new("indicator_code", Text, true),
            ],
            vec![],
            vec![],
        ),
    };

    let index = fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name.clone(), i))
        .collect();

    SchemaContract {
        dataset_type,
        fields,
        index,
        ranges,
        cross_checks,
    }
}
