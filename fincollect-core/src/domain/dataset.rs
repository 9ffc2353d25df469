use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of dataset being collected. Selects the schema contract and value shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetType {
    Ohlcv,
    Fundamentals,
    Event,
    EconomicIndicator,
}

impl DatasetType {
    pub const ALL: [DatasetType; 4] = [
        DatasetType::Ohlcv,
        DatasetType::Fundamentals,
        DatasetType::Event,
        DatasetType::EconomicIndicator,
    ];

    /// Lower-case slug used in storage paths and partition keys.
    pub fn slug(self) -> &'static str {
        match self {
            DatasetType::Ohlcv => "ohlcv",
            DatasetType::Fundamentals => "fundamentals",
            DatasetType::Event => "event",
            DatasetType::EconomicIndicator => "economic_indicator",
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatasetType::Ohlcv => "OHLCV",
            DatasetType::Fundamentals => "FUNDAMENTALS",
            DatasetType::Event => "EVENT",
            DatasetType::EconomicIndicator => "ECONOMIC_INDICATOR",
        };
        f.write_str(s)
    }
}

impl FromStr for DatasetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetType::ALL
            .into_iter()
            .find(|dt| dt.slug().eq_ignore_ascii_case(s) || dt.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown dataset type '{s}'"))
    }
}
