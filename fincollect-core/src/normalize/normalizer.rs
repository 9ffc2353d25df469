//! Maps validated raw records into [`NormalizedRecord`]s.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use super::frequency::infer_frequency;
use crate::domain::{DatasetType, FieldValue, Frequency, NormalizedRecord, RawRecord, RecordValues};
use crate::schema::{detect_frequency, FieldMapping, SchemaContract};

/// Maximum length of a generated dataset id.
pub const DATASET_ID_MAX_LEN: usize = 50;

pub const FLAG_ZERO_VOLUME: &str = "zero_volume";
pub const FLAG_MISSING_ADJ_CLOSE: &str = "missing_adj_close";

/// Common indicator names and their short forms.
const METRIC_ABBREVIATIONS: [(&str, &str); 8] = [
    ("gross domestic product", "gdp"),
    ("consumer price index", "cpi"),
    ("wage price index", "wpi"),
    ("unemployment rate", "unemploy_rate"),
    ("participation rate", "particip_rate"),
    ("retail turnover", "retail"),
    ("building approvals", "building_app"),
    ("current account", "current_acc"),
];

/// A record that passed validation still could not be mapped. Indicates a
/// contract/normalizer mismatch and is logged as a defect.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("field '{field}' missing")]
    MissingField { field: String },

    #[error("field '{field}' is not numeric: {value:?}")]
    NotNumeric { field: String, value: String },

    #[error("unparsable timestamp {value:?}")]
    UnparsableTimestamp { value: String },
}

/// What the normalizer knows about the item being collected.
#[derive(Debug, Clone, Default)]
pub struct ItemContext {
    pub provider: String,
    pub entity_id: String,
    pub category: Option<String>,
    pub metric: Option<String>,
    pub unit: Option<String>,
    /// Declared frequency. When absent, batches infer it from spacing.
    pub frequency: Option<Frequency>,
}

pub struct Normalizer {
    contract: SchemaContract,
    mapping: FieldMapping,
    context: ItemContext,
    dataset_id: String,
    collected_at: DateTime<Utc>,
}

impl Normalizer {
    pub fn new(
        contract: SchemaContract,
        mapping: FieldMapping,
        context: ItemContext,
        collected_at: DateTime<Utc>,
    ) -> Self {
        let metric = context.metric.as_deref().unwrap_or(&context.entity_id);
        let dataset_id = dataset_id(&context.provider, context.category.as_deref(), metric);
        Self {
            contract,
            mapping,
            context,
            dataset_id,
            collected_at,
        }
    }

    pub fn dataset_type(&self) -> DatasetType {
        self.contract.dataset_type()
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Normalize one record using the declared frequency (or `Unknown`).
    pub fn normalize(&self, record: &RawRecord) -> Result<NormalizedRecord, NormalizationError> {
        let frequency = self.context.frequency.unwrap_or(Frequency::Unknown);
        self.build(record, frequency)
    }

    /// Normalize a batch. Without a declared frequency the batch's median
    /// spacing decides it for every record, falling back to the period label
    /// (`Mar Qtr 2025`, `May 2025`) for single-observation batches.
    pub fn normalize_batch(
        &self,
        records: &[RawRecord],
    ) -> Result<Vec<NormalizedRecord>, NormalizationError> {
        let mut out = records
            .iter()
            .map(|r| self.normalize(r))
            .collect::<Result<Vec<_>, _>>()?;

        if self.context.frequency.is_none() {
            let timestamps: Vec<_> = out.iter().map(|r| r.timestamp).collect();
            let mut inferred = infer_frequency(&timestamps);
            if inferred == Frequency::Unknown {
                // Too few observations for spacing; the period label may still tell.
                if let Some(label) = records.first().and_then(|r| self.text(r, "timestamp")) {
                    inferred = detect_frequency(&label);
                }
            }
            debug!(dataset_id = %self.dataset_id, frequency = %inferred, "inferred frequency");
            for r in &mut out {
                r.frequency = inferred;
            }
        }
        Ok(out)
    }

    fn build(
        &self,
        record: &RawRecord,
        frequency: Frequency,
    ) -> Result<NormalizedRecord, NormalizationError> {
        let timestamp = self.timestamp(record)?;
        let values = self.values(record)?;

        let mut quality_flags = Vec::new();
        if let RecordValues::Ohlcv {
            volume, adj_close, ..
        } = &values
        {
            if *volume == 0.0 {
                quality_flags.push(FLAG_ZERO_VOLUME.to_string());
            }
            if adj_close.is_none() {
                quality_flags.push(FLAG_MISSING_ADJ_CLOSE.to_string());
            }
        }

        let entity_id = self
            .text(record, "entity_id")
            .unwrap_or_else(|| self.context.entity_id.clone());
        let unit = self.text(record, "unit").or_else(|| self.context.unit.clone());

        Ok(NormalizedRecord {
            entity_id,
            timestamp,
            dataset_type: self.contract.dataset_type(),
            dataset_id: self.dataset_id.clone(),
            frequency,
            values,
            unit,
            source: record.source().to_string(),
            collection_timestamp: self.collected_at,
            quality_flags,
        })
    }

    fn values(&self, record: &RawRecord) -> Result<RecordValues, NormalizationError> {
        Ok(match self.contract.dataset_type() {
            DatasetType::Ohlcv => RecordValues::Ohlcv {
                open: self.required_number(record, "open")?,
                high: self.required_number(record, "high")?,
                low: self.required_number(record, "low")?,
                close: self.required_number(record, "close")?,
                volume: self.required_number(record, "volume")?,
                adj_close: self.optional_number(record, "adj_close")?,
            },
            DatasetType::Fundamentals => {
                let mut metrics = std::collections::BTreeMap::new();
                for name in self.contract.number_fields() {
                    metrics.insert(name.to_string(), self.optional_number(record, name)?);
                }
                RecordValues::Fundamentals { metrics }
            }
            DatasetType::Event => RecordValues::Event {
                event_type: self.text(record, "event_type").ok_or_else(|| {
                    NormalizationError::MissingField {
                        field: "event_type".into(),
                    }
                })?,
                value: self.optional_number(record, "value")?,
            },
            DatasetType::EconomicIndicator => RecordValues::Economic {
                value: self.required_number(record, "value")?,
            },
        })
    }

    fn timestamp(&self, record: &RawRecord) -> Result<DateTime<Utc>, NormalizationError> {
        let value = self
            .present(record, "timestamp")
            .ok_or_else(|| NormalizationError::MissingField {
                field: "timestamp".into(),
            })?;
        value
            .as_timestamp()
            .ok_or_else(|| NormalizationError::UnparsableTimestamp {
                value: value.render().unwrap_or_default(),
            })
    }

    fn present<'r>(&self, record: &'r RawRecord, field: &str) -> Option<&'r FieldValue> {
        self.mapping.lookup(record, field).filter(|v| !v.is_null())
    }

    fn text(&self, record: &RawRecord, field: &str) -> Option<String> {
        self.present(record, field)
            .and_then(FieldValue::render)
            .filter(|s| !s.is_empty())
    }

    fn optional_number(
        &self,
        record: &RawRecord,
        field: &str,
    ) -> Result<Option<f64>, NormalizationError> {
        match self.present(record, field) {
            None => Ok(None),
            Some(v) => v
                .as_number()
                .map(Some)
                .ok_or_else(|| NormalizationError::NotNumeric {
                    field: field.to_string(),
                    value: v.render().unwrap_or_default(),
                }),
        }
    }

    fn required_number(&self, record: &RawRecord, field: &str) -> Result<f64, NormalizationError> {
        self.optional_number(record, field)?
            .ok_or_else(|| NormalizationError::MissingField {
                field: field.to_string(),
            })
    }
}

/// Stable dataset id: `{provider}_{category}_{metric}` slugged and capped at 50 chars.
pub fn dataset_id(provider: &str, category: Option<&str>, metric: &str) -> String {
    let mut parts = vec![slug(provider)];
    if let Some(category) = category {
        parts.push(slug(category));
    }
    parts.push(abbreviate_metric(metric));

    let id = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if id.is_empty() {
        return "unknown".to_string();
    }
    id.chars().take(DATASET_ID_MAX_LEN).collect::<String>().trim_end_matches('_').to_string()
}

fn abbreviate_metric(metric: &str) -> String {
    let lower = metric.to_lowercase();
    METRIC_ABBREVIATIONS
        .iter()
        .find(|(long, _)| lower.contains(long))
        .map(|(_, short)| short.to_string())
        .unwrap_or_else(|| slug(metric))
}

fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}
