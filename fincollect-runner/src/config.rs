//! Collection configuration.
//!
//! One TOML file describes the storage location, run-wide defaults, and every
//! provider with its items. It is parsed once at process start into a
//! [`CollectionConfig`] and passed by reference; nothing reads it globally.
//!
//! ```toml
//! [storage]
//! root = "data"
//!
//! [providers.fred]
//! dataset_type = "ECONOMIC_INDICATOR"
//! category = "rates"
//! requests_per_minute = 120
//!
//! [providers.fred.source]
//! kind = "http"
//! url_template = "https://api.stlouisfed.org/fred/series/observations?series_id={entity}&observation_start={start}&observation_end={end}&file_type=json"
//! records_path = "observations"
//! api_key_env = "FRED_API_KEY"
//!
//! [providers.fred.mapping.fields]
//! timestamp = "date"
//!
//! [[providers.fred.items]]
//! entity_id = "UNRATE"
//! expected_count = 12
//! unit = "percent"
//! ```

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use fincollect_core::data::{
    partition_key, CircuitBreaker, CsvSource, FetchError, HttpJsonConfig, HttpJsonSource,
    ParquetStore, RetryPolicy, SourceClient,
};
use fincollect_core::domain::{DatasetType, Frequency};
use fincollect_core::quality::{QualityScorer, DEFAULT_COMPLETENESS_THRESHOLD};
use fincollect_core::schema::{
    ContractError, ContractSpec, FieldMapping, MappingError, MappingTable, SchemaContract,
};

pub const DEFAULT_FRESHNESS_BUDGET_HOURS: i64 = 48;
pub const DEFAULT_LOOKBACK_DAYS: i64 = 365;

const RUN_LOG_FILE: &str = "run_log.jsonl";
const SYSTEM_SUMMARY_FILE: &str = "system_summary.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no providers configured")]
    NoProviders,

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("provider '{0}' has no items")]
    EmptyItems(String),

    #[error("provider '{provider}' lists entity '{entity}' more than once")]
    DuplicateEntity { provider: String, entity: String },

    #[error("partition '{key}' would be written by both {first} and {second}")]
    PartitionCollision {
        key: String,
        first: String,
        second: String,
    },

    #[error("provider '{provider}' contract is for {found}, provider collects {expected}")]
    ContractMismatch {
        provider: String,
        expected: DatasetType,
        found: DatasetType,
    },

    #[error("provider '{provider}' contract: {source}")]
    Contract {
        provider: String,
        source: ContractError,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: String,
        range: &'static str,
        value: f64,
    },

    #[error("provider '{provider}' source: {source}")]
    Source {
        provider: String,
        source: FetchError,
    },
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Keep a timestamped copy of every partition write.
    #[serde(default)]
    pub snapshots: bool,
    /// Run log location. Defaults to `{root}/_runs/run_log.jsonl`.
    #[serde(default)]
    pub run_log: Option<PathBuf>,
}

impl StorageConfig {
    pub fn store(&self) -> ParquetStore {
        ParquetStore::new(&self.root).with_snapshots(self.snapshots)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.run_log
            .clone()
            .unwrap_or_else(|| self.root.join("_runs").join(RUN_LOG_FILE))
    }

    /// `system_summary.json`, next to the run log.
    pub fn system_summary_path(&self) -> PathBuf {
        let log = self.run_log_path();
        match log.parent() {
            Some(dir) => dir.join(SYSTEM_SUMMARY_FILE),
            None => PathBuf::from(SYSTEM_SUMMARY_FILE),
        }
    }
}

/// Run-wide defaults, overridable per provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub completeness_threshold: f64,
    pub freshness_budget_hours: i64,
    pub retry: RetryPolicy,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            freshness_budget_hours: DEFAULT_FRESHNESS_BUDGET_HOURS,
            retry: RetryPolicy::default(),
        }
    }
}

/// What to do with records that fail validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidRecordPolicy {
    /// Any violation fails the whole item.
    #[default]
    FailItem,
    /// Drop invalid records and report their violations as quality issues.
    DropRecord,
}

/// Where a provider's raw records come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Csv {
        dir: PathBuf,
        #[serde(default)]
        date_column: Option<String>,
    },
    Http(HttpJsonConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub dataset_type: DatasetType,
    /// Grouping used in dataset ids, e.g. `asx_200` or `prices`.
    #[serde(default)]
    pub category: Option<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub mapping: FieldMapping,
    /// Replaces the built-in contract for this provider's dataset type.
    #[serde(default)]
    pub contract: Option<ContractSpec>,
    #[serde(default)]
    pub on_invalid: InvalidRecordPolicy,
    /// Items not started within this many seconds fail as budget-exhausted.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub parallel_items: bool,
    #[serde(default)]
    pub completeness_threshold: Option<f64>,
    #[serde(default)]
    pub freshness_budget_hours: Option<i64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

/// One entity to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub entity_id: String,
    #[serde(default)]
    pub expected_count: usize,
    #[serde(default)]
    pub unit: Option<String>,
    /// Metric name used in the dataset id. Defaults to the entity id.
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub frequency: Option<Frequency>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
}

fn default_lookback_days() -> i64 {
    DEFAULT_LOOKBACK_DAYS
}

impl ItemConfig {
    pub fn new(entity_id: impl Into<String>, expected_count: usize) -> Self {
        Self {
            entity_id: entity_id.into(),
            expected_count,
            unit: None,
            metric: None,
            frequency: None,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }

    pub fn is_percent(&self) -> bool {
        matches!(
            self.unit.as_deref().map(str::trim),
            Some(u) if u == "%" || u.eq_ignore_ascii_case("percent")
        )
    }
}

impl CollectionConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks: every provider has items with unique entities, its
    /// mapping fits its contract, and no two items share a partition file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        check_threshold("defaults.completeness_threshold", self.defaults.completeness_threshold)?;
        let mut owners: HashMap<String, String> = HashMap::new();
        for (name, provider) in &self.providers {
            provider.validate(name)?;
            for (key, entity) in provider.partitions() {
                let owner = format!("{name}/{entity}");
                if let Some(first) = owners.get(&key) {
                    return Err(ConfigError::PartitionCollision {
                        key,
                        first: first.clone(),
                        second: owner,
                    });
                }
                owners.insert(key, owner);
            }
        }
        self.mapping_table()?;
        Ok(())
    }

    /// Every provider's field mapping, checked against its contract.
    pub fn mapping_table(&self) -> Result<MappingTable, ConfigError> {
        let mut table = MappingTable::new();
        for (name, provider) in &self.providers {
            let contract = provider.contract(name)?;
            table.insert(name, &contract, provider.mapping.clone())?;
        }
        Ok(table)
    }

    pub fn provider(&self, name: &str) -> Result<&ProviderConfig, ConfigError> {
        self.providers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProvider(name.to_string()))
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl ProviderConfig {
    pub fn new(dataset_type: DatasetType, source: SourceConfig) -> Self {
        Self {
            dataset_type,
            category: None,
            source,
            requests_per_minute: None,
            mapping: FieldMapping::identity(),
            contract: None,
            on_invalid: InvalidRecordPolicy::FailItem,
            run_timeout_secs: None,
            parallel_items: false,
            completeness_threshold: None,
            freshness_budget_hours: None,
            retry: None,
            items: Vec::new(),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.items.is_empty() {
            return Err(ConfigError::EmptyItems(name.to_string()));
        }
        let mut seen: HashMap<String, &str> = HashMap::new();
        for (key, entity) in self.partitions() {
            match seen.get(&key) {
                Some(first) if *first == entity => {
                    return Err(ConfigError::DuplicateEntity {
                        provider: name.to_string(),
                        entity: entity.to_string(),
                    });
                }
                Some(first) => {
                    return Err(ConfigError::PartitionCollision {
                        key,
                        first: format!("{name}/{first}"),
                        second: format!("{name}/{entity}"),
                    });
                }
                None => {
                    seen.insert(key, entity);
                }
            }
        }
        if let Some(t) = self.completeness_threshold {
            check_threshold(&format!("providers.{name}.completeness_threshold"), t)?;
        }
        let contract = self.contract(name)?;
        self.mapping.check(name, &contract)?;
        Ok(())
    }

    /// `(partition key, trimmed entity id)` for every item.
    pub fn partitions(&self) -> impl Iterator<Item = (String, &str)> + '_ {
        self.items.iter().map(|item| {
            let entity = item.entity_id.trim();
            (partition_key(entity, self.dataset_type), entity)
        })
    }

    /// The compiled contract: the provider's own spec if given, else the built-in.
    pub fn contract(&self, name: &str) -> Result<SchemaContract, ConfigError> {
        let Some(spec) = &self.contract else {
            return Ok(SchemaContract::builtin(self.dataset_type).clone());
        };
        if spec.dataset_type != self.dataset_type {
            return Err(ConfigError::ContractMismatch {
                provider: name.to_string(),
                expected: self.dataset_type,
                found: spec.dataset_type,
            });
        }
        SchemaContract::compile(spec.clone()).map_err(|source| ConfigError::Contract {
            provider: name.to_string(),
            source,
        })
    }

    pub fn retry_policy(&self, defaults: &Defaults) -> RetryPolicy {
        self.retry.unwrap_or(defaults.retry)
    }

    pub fn scorer(&self, defaults: &Defaults) -> QualityScorer {
        QualityScorer::new(
            self.completeness_threshold
                .unwrap_or(defaults.completeness_threshold),
            Duration::hours(
                self.freshness_budget_hours
                    .unwrap_or(defaults.freshness_budget_hours),
            ),
        )
    }

    /// Build the source client this provider reads from.
    pub fn build_source(&self, name: &str) -> Result<Arc<dyn SourceClient>, ConfigError> {
        match &self.source {
            SourceConfig::Csv { dir, date_column } => {
                let mut source = CsvSource::new(name, dir);
                if let Some(column) = date_column {
                    source = source.with_date_filter(column);
                }
                if let Some(rpm) = self.requests_per_minute {
                    source = source.with_requests_per_minute(rpm);
                }
                Ok(Arc::new(source))
            }
            SourceConfig::Http(http) => {
                let mut http = http.clone();
                if self.requests_per_minute.is_some() {
                    http.requests_per_minute = self.requests_per_minute;
                }
                let breaker = Arc::new(CircuitBreaker::default_provider(name));
                let source = HttpJsonSource::new(name, http, breaker).map_err(|source| {
                    ConfigError::Source {
                        provider: name.to_string(),
                        source,
                    }
                })?;
                Ok(Arc::new(source))
            }
        }
    }
}

fn check_threshold(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field: field.to_string(),
            range: "[0, 1]",
            value,
        })
    }
}
