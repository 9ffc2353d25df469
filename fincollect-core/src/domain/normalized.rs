//! The unified record shape produced by the normalizer and persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::dataset::DatasetType;

/// Observation frequency, declared by the provider or inferred from spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
    Irregular,
    Unknown,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Annual => "annual",
            Frequency::Irregular => "irregular",
            Frequency::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    /// Accepts long names and the single-letter codes economic APIs use (D, W, M, Q, A).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let freq = match lower.as_str() {
            "d" | "daily" | "1d" => Frequency::Daily,
            "w" | "weekly" | "1wk" => Frequency::Weekly,
            "m" | "monthly" | "1mo" => Frequency::Monthly,
            "q" | "quarterly" => Frequency::Quarterly,
            "a" | "y" | "annual" | "yearly" => Frequency::Annual,
            "irregular" => Frequency::Irregular,
            "unknown" => Frequency::Unknown,
            _ => {
                // FRED style: "Monthly, End of Period"
                let head = lower.split(',').next().unwrap_or("").trim();
                if head != lower {
                    return head.parse();
                }
                return Err(format!("unknown frequency '{s}'"));
            }
        };
        Ok(freq)
    }
}

/// Typed values per dataset type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordValues {
    Ohlcv {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        adj_close: Option<f64>,
    },
    Fundamentals {
        metrics: BTreeMap<String, Option<f64>>,
    },
    Event {
        event_type: String,
        value: Option<f64>,
    },
    Economic {
        value: f64,
    },
}

impl RecordValues {
    pub fn dataset_type(&self) -> DatasetType {
        match self {
            RecordValues::Ohlcv { .. } => DatasetType::Ohlcv,
            RecordValues::Fundamentals { .. } => DatasetType::Fundamentals,
            RecordValues::Event { .. } => DatasetType::Event,
            RecordValues::Economic { .. } => DatasetType::EconomicIndicator,
        }
    }
}

/// One observation in the unified schema. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub dataset_type: DatasetType,
    pub dataset_id: String,
    pub frequency: Frequency,
    pub values: RecordValues,
    pub unit: Option<String>,
    pub source: String,
    pub collection_timestamp: DateTime<Utc>,
    pub quality_flags: Vec<String>,
}

impl NormalizedRecord {
    /// The uniqueness key within a storage partition.
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (self.entity_id.as_str(), self.timestamp)
    }
}
