//! Batch quality scoring: completeness, freshness, duplicates and gaps.
//!
//! Scoring is pure. Duplicates are counted and reported here; dropping them is
//! the store's decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::{DatasetType, Frequency, NormalizedRecord, RecordValues};

pub const DEFAULT_COMPLETENESS_THRESHOLD: f64 = 0.95;

/// Gaps longer than this in a daily series are reported.
pub const MAX_DAILY_GAP_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub dataset_type: Option<DatasetType>,
    pub entity_id: Option<String>,
    /// `record_count / expected_count`, clamped to `[0, 1]`.
    pub completeness: f64,
    /// Hours between `now` and the newest observation. `None` for an empty batch.
    pub freshness_hours: Option<f64>,
    pub record_count: usize,
    pub expected_count: usize,
    pub duplicate_count: usize,
    /// 0-100: mean of completeness, freshness factor and uniqueness.
    pub overall_score: f64,
    pub issues: Vec<String>,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Scoring thresholds for one item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityScorer {
    pub completeness_threshold: f64,
    pub freshness_budget: Duration,
}

impl QualityScorer {
    pub fn new(completeness_threshold: f64, freshness_budget: Duration) -> Self {
        Self {
            completeness_threshold,
            freshness_budget,
        }
    }

    pub fn score(
        &self,
        batch: &[NormalizedRecord],
        expected_count: usize,
        now: DateTime<Utc>,
    ) -> QualityReport {
        let mut issues = Vec::new();
        let record_count = batch.len();

        let completeness = if expected_count == 0 {
            if record_count > 0 {
                issues.push(format!(
                    "expected_count is 0 but {record_count} records were collected"
                ));
            }
            1.0
        } else {
            (record_count as f64 / expected_count as f64).clamp(0.0, 1.0)
        };
        if expected_count > 0 && completeness < self.completeness_threshold {
            issues.push(format!(
                "completeness {:.1}% below threshold {:.1}% ({record_count} of {expected_count})",
                completeness * 100.0,
                self.completeness_threshold * 100.0
            ));
        }

        let freshness_hours = batch
            .iter()
            .map(|r| r.timestamp)
            .max()
            .map(|latest| (now - latest).num_seconds() as f64 / 3600.0);
        let budget_hours = self.freshness_budget.num_seconds() as f64 / 3600.0;
        if let Some(hours) = freshness_hours {
            if hours > budget_hours {
                issues.push(format!(
                    "latest observation is {hours:.1}h old, budget {budget_hours:.1}h"
                ));
            }
        }

        let duplicate_count = count_duplicates(batch);
        if duplicate_count > 0 {
            issues.push(format!(
                "{duplicate_count} duplicate (entity_id, timestamp) pairs"
            ));
        }

        let zero_volume = batch
            .iter()
            .filter(|r| matches!(r.values, RecordValues::Ohlcv { volume, .. } if volume == 0.0))
            .count();
        if zero_volume > 0 {
            issues.push(format!("{zero_volume} bars with zero volume"));
        }

        if let Some(issue) = daily_gaps(batch) {
            issues.push(issue);
        }

        let freshness_factor = match freshness_hours {
            None => 0.0,
            Some(h) if h <= budget_hours => 1.0,
            Some(h) => (budget_hours / h).clamp(0.0, 1.0),
        };
        let uniqueness = if record_count == 0 {
            1.0
        } else {
            1.0 - duplicate_count as f64 / record_count as f64
        };
        let overall_score = (completeness + freshness_factor + uniqueness) / 3.0 * 100.0;

        QualityReport {
            dataset_type: batch.first().map(|r| r.dataset_type),
            entity_id: batch.first().map(|r| r.entity_id.clone()),
            completeness,
            freshness_hours,
            record_count,
            expected_count,
            duplicate_count,
            overall_score,
            issues,
        }
    }
}

/// Score a batch with the default completeness threshold.
pub fn score(
    batch: &[NormalizedRecord],
    expected_count: usize,
    freshness_budget: Duration,
    now: DateTime<Utc>,
) -> QualityReport {
    QualityScorer::new(DEFAULT_COMPLETENESS_THRESHOLD, freshness_budget).score(
        batch,
        expected_count,
        now,
    )
}

fn count_duplicates(batch: &[NormalizedRecord]) -> usize {
    let mut seen = HashSet::with_capacity(batch.len());
    batch.iter().filter(|r| !seen.insert(r.key())).count()
}

fn daily_gaps(batch: &[NormalizedRecord]) -> Option<String> {
    if !batch.iter().any(|r| r.frequency == Frequency::Daily) {
        return None;
    }
    let mut stamps: Vec<DateTime<Utc>> = batch.iter().map(|r| r.timestamp).collect();
    stamps.sort();
    stamps.dedup();

    let limit = Duration::days(MAX_DAILY_GAP_DAYS);
    let gaps: Vec<Duration> = stamps
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|gap| *gap > limit)
        .collect();
    let largest = gaps.iter().max()?;
    Some(format!(
        "{} gaps longer than {MAX_DAILY_GAP_DAYS} days (largest {} days)",
        gaps.len(),
        largest.num_days()
    ))
}
