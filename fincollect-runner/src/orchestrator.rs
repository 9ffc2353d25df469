//! Collector orchestrator: drives one provider end to end.
//!
//! Each configured item moves through
//! `PENDING → FETCHING → VALIDATING → NORMALIZING → SCORING → WRITING → DONE`,
//! with `FAILED` reachable from any stage. Fetch and write are the only I/O;
//! the stages in between are the pure functions [`validate_stage`],
//! [`normalize_stage`] and [`score_stage`].
//!
//! Per-item failures are contained: they become an [`ItemError`] in the
//! [`RunSummary`] and the run moves on. Provider-level conditions (storage root
//! unreachable, source unavailable) fail the remaining items with that cause.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use fincollect_core::data::{
    partition_key, DateRange, FetchError, ParquetStore, RetryPolicy, SourceClient, StorageError,
    Throttle, WriteResult,
};
use fincollect_core::domain::{NormalizedRecord, RawRecord};
use fincollect_core::normalize::{ItemContext, NormalizationError, Normalizer};
use fincollect_core::quality::{QualityReport, QualityScorer};
use fincollect_core::schema::{ValidationError, Validator};

use crate::config::{
    CollectionConfig, ConfigError, Defaults, InvalidRecordPolicy, ItemConfig, ProviderConfig,
};

pub const KIND_VALIDATION: &str = "validation";
pub const KIND_NORMALIZATION: &str = "normalization";
pub const KIND_STORAGE: &str = "storage";
pub const KIND_STORAGE_UNREACHABLE: &str = "storage_unreachable";
pub const KIND_PROVIDER_UNAVAILABLE: &str = "provider_unavailable";
pub const KIND_BUDGET_EXHAUSTED: &str = "budget_exhausted";

/// Where an item is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Pending,
    Fetching,
    Validating,
    Normalizing,
    Scoring,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Pending => "pending",
            Stage::Fetching => "fetching",
            Stage::Validating => "validating",
            Stage::Normalizing => "normalizing",
            Stage::Scoring => "scoring",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Every item succeeded.
    Success,
    /// Some items failed for item-level reasons.
    PartialFailure,
    /// Storage failed for at least one item.
    Degraded,
    /// Nothing succeeded and every failure was the source being out of reach.
    Unreachable,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::PartialFailure => "PARTIAL_FAILURE",
            RunStatus::Degraded => "DEGRADED",
            RunStatus::Unreachable => "UNREACHABLE",
        })
    }
}

/// A failed item: which one, at which stage, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    /// The stage that failed.
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

impl ItemError {
    /// The failure says nothing about the item itself, only that the provider
    /// could not be reached.
    pub fn is_unreachable(&self) -> bool {
        self.kind == KIND_PROVIDER_UNAVAILABLE
            || self.kind == FetchError::CircuitBreakerTripped.kind()
            || (self.stage == Stage::Fetching && self.transient)
    }

    fn for_item(&self, item: &str) -> Self {
        Self {
            item: item.to_string(),
            ..self.clone()
        }
    }
}

/// One retry of a transient fetch failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub item: String,
    /// The attempt that failed (1-based).
    pub attempt: u32,
    pub delay_ms: u64,
    pub message: String,
}

/// Result of driving one item through the pipeline.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub entity_id: String,
    /// `Done` or `Failed`.
    pub stage: Stage,
    pub quality: Option<QualityReport>,
    pub written: Option<WriteResult>,
    pub error: Option<ItemError>,
    pub retries: Vec<RetryRecord>,
}

impl ItemOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn failed(entity_id: &str, error: ItemError, retries: Vec<RetryRecord>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            stage: Stage::Failed,
            quality: None,
            written: None,
            error: Some(error),
            retries,
        }
    }
}

/// Outcome of one provider run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items_attempted: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
    pub quality_reports: Vec<QualityReport>,
    pub errors: Vec<ItemError>,
    #[serde(default)]
    pub retries: Vec<RetryRecord>,
    pub status: RunStatus,
}

impl RunSummary {
    pub fn new(provider: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            provider: provider.into(),
            started_at,
            finished_at: started_at,
            items_attempted: 0,
            items_succeeded: 0,
            items_failed: 0,
            quality_reports: Vec::new(),
            errors: Vec::new(),
            retries: Vec::new(),
            status: RunStatus::Success,
        }
    }

    /// Fold one item outcome into the totals. Order does not matter.
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.items_attempted += 1;
        if outcome.succeeded() {
            self.items_succeeded += 1;
        } else {
            self.items_failed += 1;
        }
        self.quality_reports.extend(outcome.quality);
        self.errors.extend(outcome.error);
        self.retries.extend(outcome.retries);
        self.status = self.classify();
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.status = self.classify();
    }

    pub fn classify(&self) -> RunStatus {
        if self.items_failed == 0 {
            RunStatus::Success
        } else if self.errors.iter().any(|e| e.stage == Stage::Writing) {
            RunStatus::Degraded
        } else if self.items_succeeded == 0 && self.errors.iter().all(ItemError::is_unreachable) {
            RunStatus::Unreachable
        } else {
            RunStatus::PartialFailure
        }
    }

    /// `items_succeeded / items_attempted`, 1.0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.items_attempted == 0 {
            1.0
        } else {
            self.items_succeeded as f64 / self.items_attempted as f64
        }
    }

    pub fn mean_quality_score(&self) -> Option<f64> {
        if self.quality_reports.is_empty() {
            return None;
        }
        let total: f64 = self.quality_reports.iter().map(|r| r.overall_score).sum();
        Some(total / self.quality_reports.len() as f64)
    }

    /// 0 all items succeeded, 2 the provider was unreachable, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::Unreachable => 2,
            RunStatus::PartialFailure | RunStatus::Degraded => 1,
        }
    }

    pub fn retries_for(&self, item: &str) -> impl Iterator<Item = &RetryRecord> {
        let item = item.to_string();
        self.retries.iter().filter(move |r| r.item == item)
    }
}

/// Progress callbacks for a provider run.
pub trait CollectProgress: Send + Sync {
    fn on_item_start(&self, provider: &str, entity_id: &str, index: usize, total: usize);

    fn on_item_complete(&self, provider: &str, outcome: &ItemOutcome, index: usize, total: usize);

    fn on_run_complete(&self, summary: &RunSummary);
}

/// Prints one line per item to stdout.
pub struct StdoutProgress;

impl CollectProgress for StdoutProgress {
    fn on_item_start(&self, provider: &str, entity_id: &str, index: usize, total: usize) {
        println!("[{provider} {}/{}] Collecting {entity_id}...", index + 1, total);
    }

    fn on_item_complete(&self, _provider: &str, outcome: &ItemOutcome, _index: usize, _total: usize) {
        match (&outcome.error, &outcome.quality) {
            (None, Some(q)) => println!(
                "  OK: {} ({} records, completeness {:.1}%, score {:.0})",
                outcome.entity_id,
                q.record_count,
                q.completeness * 100.0,
                q.overall_score
            ),
            (None, None) => println!("  OK: {}", outcome.entity_id),
            (Some(e), _) => println!("  FAIL: {} [{}] {}", outcome.entity_id, e.stage, e.message),
        }
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        println!(
            "\n{}: {}/{} succeeded, {} failed ({})",
            summary.provider,
            summary.items_succeeded,
            summary.items_attempted,
            summary.items_failed,
            summary.status
        );
    }
}

/// Records that survived validation, plus findings to carry into the quality report.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub records: Vec<RawRecord>,
    pub issues: Vec<String>,
}

/// Validate a fetched batch under the provider's invalid-record policy.
///
/// Under `DropRecord` the batch only fails when nothing valid is left.
pub fn validate_stage(
    validator: &Validator,
    raw: Vec<RawRecord>,
    policy: InvalidRecordPolicy,
) -> Result<ValidatedBatch, ValidationError> {
    let total_records = raw.len();
    let mut records = Vec::with_capacity(total_records);
    let mut issues = Vec::new();
    let mut violations = Vec::new();

    for (idx, record) in raw.into_iter().enumerate() {
        let result = validator.validate(record);
        issues.extend(result.issues);
        if result.passed {
            records.push(result.record);
        } else {
            violations.push((idx, result.violations));
        }
    }

    if violations.is_empty() {
        return Ok(ValidatedBatch { records, issues });
    }
    match policy {
        InvalidRecordPolicy::DropRecord if !records.is_empty() => {
            for (idx, vs) in &violations {
                for v in vs {
                    issues.push(format!("record {idx} dropped: {v}"));
                }
            }
            Ok(ValidatedBatch { records, issues })
        }
        _ => Err(ValidationError {
            total_records,
            violations,
        }),
    }
}

pub fn normalize_stage(
    normalizer: &Normalizer,
    batch: &ValidatedBatch,
) -> Result<Vec<NormalizedRecord>, NormalizationError> {
    normalizer.normalize_batch(&batch.records)
}

/// Score a normalized batch and append the validation findings to its issues.
pub fn score_stage(
    scorer: &QualityScorer,
    batch: &[NormalizedRecord],
    expected_count: usize,
    now: DateTime<Utc>,
    validation_issues: Vec<String>,
) -> QualityReport {
    let mut report = scorer.score(batch, expected_count, now);
    report.issues.extend(validation_issues);
    report
}

/// Drives one provider's items through the pipeline.
pub struct Collector {
    provider: String,
    config: ProviderConfig,
    validator: Validator,
    /// Contract with percent bounds on `value`, for items measured in percent.
    percent_validator: Option<Validator>,
    source: Arc<dyn SourceClient>,
    store: ParquetStore,
    retry: RetryPolicy,
    scorer: QualityScorer,
    throttle: Throttle,
    as_of: Option<DateTime<Utc>>,
}

impl Collector {
    pub fn new(
        provider: impl Into<String>,
        config: ProviderConfig,
        defaults: &Defaults,
        source: Arc<dyn SourceClient>,
        store: ParquetStore,
    ) -> Result<Self, ConfigError> {
        let provider = provider.into();
        config.validate(&provider)?;
        let contract = config.contract(&provider)?;
        let percent_validator = contract
            .clone()
            .with_percent_bounds("value")
            .ok()
            .map(|c| Validator::new(c, config.mapping.clone()));
        let throttle = match config
            .requests_per_minute
            .or_else(|| source.requests_per_minute())
        {
            Some(rpm) => Throttle::per_minute(rpm),
            None => Throttle::unpaced(),
        };

        Ok(Self {
            validator: Validator::new(contract, config.mapping.clone()),
            percent_validator,
            retry: config.retry_policy(defaults),
            scorer: config.scorer(defaults),
            throttle,
            provider,
            config,
            source,
            store,
            as_of: None,
        })
    }

    /// Build a collector for `provider` with the source, store and field
    /// mapping its configuration names.
    pub fn from_config(config: &CollectionConfig, provider: &str) -> Result<Self, ConfigError> {
        let mut provider_config = config.provider(provider)?.clone();
        provider_config.mapping = config
            .mapping_table()?
            .get(provider, provider_config.dataset_type);
        let source = provider_config.build_source(provider)?;
        Self::new(
            provider,
            provider_config,
            &config.defaults,
            source,
            config.storage.store(),
        )
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Score freshness and date ranges against `now` instead of the wall clock.
    pub fn as_of(mut self, now: DateTime<Utc>) -> Self {
        self.as_of = Some(now);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn store(&self) -> &ParquetStore {
        &self.store
    }

    pub fn run(&self) -> RunSummary {
        self.run_with_progress(None)
    }

    pub fn run_with_progress(&self, progress: Option<&dyn CollectProgress>) -> RunSummary {
        let started_at = Utc::now();
        let now = self.as_of.unwrap_or(started_at);
        let total = self.config.items.len();
        info!(provider = %self.provider, items = total, parallel = self.config.parallel_items, "collection started");

        let halt = Mutex::new(self.preflight());
        let deadline = self
            .config
            .run_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let run_one = |(index, item): (usize, &ItemConfig)| {
            if let Some(p) = progress {
                p.on_item_start(&self.provider, &item.entity_id, index, total);
            }
            let outcome = self.run_item(item, now, deadline, &halt);
            if let Some(p) = progress {
                p.on_item_complete(&self.provider, &outcome, index, total);
            }
            outcome
        };

        let outcomes: Vec<ItemOutcome> = if self.config.parallel_items {
            self.config.items.par_iter().enumerate().map(run_one).collect()
        } else {
            self.config.items.iter().enumerate().map(run_one).collect()
        };

        let mut summary = RunSummary::new(self.provider.clone(), started_at);
        for outcome in outcomes {
            summary.record(outcome);
        }
        summary.finish(Utc::now());

        info!(
            provider = %self.provider,
            succeeded = summary.items_succeeded,
            failed = summary.items_failed,
            retries = summary.retries.len(),
            status = %summary.status,
            "collection finished"
        );
        if let Some(p) = progress {
            p.on_run_complete(&summary);
        }
        summary
    }

    /// Provider-level checks before any item starts.
    fn preflight(&self) -> Option<ItemError> {
        if let Err(e) = self.store.check_root() {
            error!(provider = %self.provider, error = %e, "storage root unreachable");
            return Some(ItemError {
                item: String::new(),
                stage: Stage::Writing,
                kind: KIND_STORAGE_UNREACHABLE.to_string(),
                message: e.to_string(),
                transient: false,
            });
        }
        if !self.source.is_available() {
            warn!(provider = %self.provider, source = self.source.name(), "source unavailable");
            return Some(ItemError {
                item: String::new(),
                stage: Stage::Fetching,
                kind: KIND_PROVIDER_UNAVAILABLE.to_string(),
                message: format!("source '{}' is unavailable", self.source.name()),
                transient: true,
            });
        }
        None
    }

    fn run_item(
        &self,
        item: &ItemConfig,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
        halt: &Mutex<Option<ItemError>>,
    ) -> ItemOutcome {
        let halted = halt.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(cause) = halted {
            warn!(provider = %self.provider, entity = %item.entity_id, kind = %cause.kind, "skipping item");
            return ItemOutcome::failed(&item.entity_id, cause.for_item(&item.entity_id), Vec::new());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(provider = %self.provider, entity = %item.entity_id, "run budget exhausted");
            let error = ItemError {
                item: item.entity_id.clone(),
                stage: Stage::Pending,
                kind: KIND_BUDGET_EXHAUSTED.to_string(),
                message: "run timeout budget exhausted before the item started".to_string(),
                transient: false,
            };
            return ItemOutcome::failed(&item.entity_id, error, Vec::new());
        }

        let outcome = self.collect_item(item, now);

        if let Some(err) = &outcome.error {
            let cause = match err.stage {
                Stage::Fetching if !self.source.is_available() => Some(ItemError {
                    item: String::new(),
                    stage: Stage::Fetching,
                    kind: KIND_PROVIDER_UNAVAILABLE.to_string(),
                    message: format!(
                        "source '{}' became unavailable: {}",
                        self.source.name(),
                        err.message
                    ),
                    transient: true,
                }),
                Stage::Writing if err.kind == KIND_STORAGE_UNREACHABLE => Some(err.for_item("")),
                _ => None,
            };
            if let Some(cause) = cause {
                let mut slot = halt.lock().unwrap_or_else(PoisonError::into_inner);
                slot.get_or_insert(cause);
            }
        }
        outcome
    }

    /// Run one item through every stage. Never panics on bad data; every
    /// failure comes back as an [`ItemError`].
    pub fn collect_item(&self, item: &ItemConfig, now: DateTime<Utc>) -> ItemOutcome {
        let entity = item.entity_id.as_str();
        let mut retries = Vec::new();

        debug!(provider = %self.provider, entity, stage = %Stage::Fetching);
        let range = DateRange::lookback(item.lookback_days, now.date_naive());
        let raw = match self.fetch_with_retry(entity, &range, &mut retries) {
            Ok(raw) => raw,
            Err(e) => {
                let error = self.item_error(entity, Stage::Fetching, e.kind(), e.to_string(), e.is_transient());
                return ItemOutcome::failed(entity, error, retries);
            }
        };

        debug!(provider = %self.provider, entity, stage = %Stage::Validating, records = raw.len());
        let validator = match &self.percent_validator {
            Some(v) if item.is_percent() => v,
            _ => &self.validator,
        };
        let validated = match validate_stage(validator, raw, self.config.on_invalid) {
            Ok(v) => v,
            Err(e) => {
                let error = self.item_error(entity, Stage::Validating, KIND_VALIDATION, e.to_string(), false);
                return ItemOutcome::failed(entity, error, retries);
            }
        };

        debug!(provider = %self.provider, entity, stage = %Stage::Normalizing, records = validated.records.len());
        let normalizer = Normalizer::new(
            validator.contract().clone(),
            validator.mapping().clone(),
            self.item_context(item),
            now,
        );
        let batch = match normalize_stage(&normalizer, &validated) {
            Ok(batch) => batch,
            Err(e) => {
                // Validated records that cannot be normalized mean the contract
                // and the normalizer disagree.
                error!(provider = %self.provider, entity, error = %e, "normalization defect");
                let error = self.item_error(entity, Stage::Normalizing, KIND_NORMALIZATION, e.to_string(), false);
                return ItemOutcome::failed(entity, error, retries);
            }
        };

        debug!(provider = %self.provider, entity, stage = %Stage::Scoring);
        let report = score_stage(&self.scorer, &batch, item.expected_count, now, validated.issues);
        for issue in &report.issues {
            warn!(provider = %self.provider, entity, issue = %issue, "quality issue");
        }

        debug!(provider = %self.provider, entity, stage = %Stage::Writing);
        let key = partition_key(entity, self.config.dataset_type);
        match self.store.write(&batch, self.config.dataset_type, &key) {
            Ok(written) => {
                info!(
                    provider = %self.provider,
                    entity,
                    records = written.record_count,
                    completeness = report.completeness,
                    path = %written.path.display(),
                    "item collected"
                );
                ItemOutcome {
                    entity_id: entity.to_string(),
                    stage: Stage::Done,
                    quality: Some(report),
                    written: Some(written),
                    error: None,
                    retries,
                }
            }
            Err(e) => {
                let kind = match e {
                    StorageError::Unreachable { .. } => KIND_STORAGE_UNREACHABLE,
                    _ => KIND_STORAGE,
                };
                let error = self.item_error(entity, Stage::Writing, kind, e.to_string(), false);
                ItemOutcome {
                    quality: Some(report),
                    ..ItemOutcome::failed(entity, error, retries)
                }
            }
        }
    }

    fn fetch_with_retry(
        &self,
        entity: &str,
        range: &DateRange,
        retries: &mut Vec<RetryRecord>,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let mut attempt = 1;
        loop {
            let waited = self.throttle.wait();
            if !waited.is_zero() {
                debug!(provider = %self.provider, entity, waited_ms = waited.as_millis() as u64, "throttled");
            }
            match self.source.fetch(entity, range) {
                Ok(records) => {
                    debug!(provider = %self.provider, entity, attempt, records = records.len(), "fetched");
                    return Ok(records);
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for(attempt, &e);
                    warn!(
                        provider = %self.provider,
                        entity,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    retries.push(RetryRecord {
                        item: entity.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        message: e.to_string(),
                    });
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn item_context(&self, item: &ItemConfig) -> ItemContext {
        ItemContext {
            provider: self.provider.clone(),
            entity_id: item.entity_id.clone(),
            category: self.config.category.clone(),
            metric: item.metric.clone(),
            unit: item.unit.clone(),
            frequency: item.frequency,
        }
    }

    fn item_error(
        &self,
        entity: &str,
        stage: Stage,
        kind: &str,
        message: String,
        transient: bool,
    ) -> ItemError {
        error!(provider = %self.provider, entity, stage = %stage, kind, error = %message, "item failed");
        ItemError {
            item: entity.to_string(),
            stage,
            kind: kind.to_string(),
            message,
            transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fincollect_core::domain::DatasetType;
    use fincollect_core::schema::Rule;

    fn bar(date: &str, low: f64, high: f64) -> RawRecord {
        RawRecord::new("test", Utc::now())
            .with("timestamp", date)
            .with("open", (low + high) / 2.0)
            .with("high", high)
            .with("low", low)
            .with("close", (low + high) / 2.0)
            .with("volume", 100.0)
    }

    fn error(stage: Stage, kind: &str, transient: bool) -> ItemError {
        ItemError {
            item: "X".into(),
            stage,
            kind: kind.into(),
            message: "boom".into(),
            transient,
        }
    }

    fn outcome(error: Option<ItemError>) -> ItemOutcome {
        ItemOutcome {
            entity_id: "X".into(),
            stage: if error.is_some() { Stage::Failed } else { Stage::Done },
            quality: None,
            written: None,
            error,
            retries: Vec::new(),
        }
    }

    #[test]
    fn fail_item_policy_rejects_batch() {
        let validator = Validator::builtin(DatasetType::Ohlcv);
        let raw = vec![bar("2024-01-02", 90.0, 100.0), bar("2024-01-03", 110.0, 100.0)];
        let err = validate_stage(&validator, raw, InvalidRecordPolicy::FailItem).unwrap_err();
        assert_eq!(err.total_records, 2);
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].0, 1);
        assert_eq!(err.violations[0].1[0].rule, Rule::Range);
    }

    #[test]
    fn drop_record_policy_keeps_valid_records() {
        let validator = Validator::builtin(DatasetType::Ohlcv);
        let raw = vec![bar("2024-01-02", 90.0, 100.0), bar("2024-01-03", 110.0, 100.0)];
        let batch = validate_stage(&validator, raw, InvalidRecordPolicy::DropRecord).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.issues.len(), 1);
        assert!(batch.issues[0].starts_with("record 1 dropped"));

        let all_bad = vec![bar("2024-01-03", 110.0, 100.0)];
        assert!(validate_stage(&validator, all_bad, InvalidRecordPolicy::DropRecord).is_err());
    }

    #[test]
    fn status_classification() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut ok = RunSummary::new("p", now);
        ok.record(outcome(None));
        assert_eq!(ok.classify(), RunStatus::Success);
        assert_eq!(ok.exit_code(), 0);

        let mut partial = ok.clone();
        partial.record(outcome(Some(error(Stage::Fetching, "entity_not_found", false))));
        assert_eq!(partial.classify(), RunStatus::PartialFailure);
        assert_eq!(partial.exit_code(), 1);

        let mut degraded = ok.clone();
        degraded.record(outcome(Some(error(Stage::Writing, KIND_STORAGE, false))));
        assert_eq!(degraded.classify(), RunStatus::Degraded);

        let mut unreachable = RunSummary::new("p", now);
        unreachable.record(outcome(Some(error(Stage::Fetching, "timeout", true))));
        unreachable.record(outcome(Some(error(Stage::Fetching, KIND_PROVIDER_UNAVAILABLE, true))));
        assert_eq!(unreachable.classify(), RunStatus::Unreachable);
        assert_eq!(unreachable.exit_code(), 2);
        assert_eq!(unreachable.success_rate(), 0.0);
    }

    #[test]
    fn aggregation_is_order_insensitive() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let outcomes = vec![
            outcome(None),
            outcome(Some(error(Stage::Validating, KIND_VALIDATION, false))),
            outcome(None),
        ];
        let mut forward = RunSummary::new("p", now);
        for o in outcomes.iter().cloned() {
            forward.record(o);
        }
        let mut backward = RunSummary::new("p", now);
        for o in outcomes.into_iter().rev() {
            backward.record(o);
        }
        assert_eq!(forward.items_succeeded, backward.items_succeeded);
        assert_eq!(forward.items_failed, backward.items_failed);
        assert_eq!(forward.classify(), backward.classify());
    }

    #[test]
    fn empty_run_has_full_success_rate() {
        let summary = RunSummary::new("p", Utc::now());
        assert_eq!(summary.success_rate(), 1.0);
        assert_eq!(summary.mean_quality_score(), None);
    }

    #[test]
    fn summary_serializes_status_in_caps() {
        let mut summary = RunSummary::new("p", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        summary.record(outcome(Some(error(Stage::Fetching, "timeout", true))));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "UNREACHABLE");
        assert_eq!(json["errors"][0]["stage"], "FETCHING");
    }
}
