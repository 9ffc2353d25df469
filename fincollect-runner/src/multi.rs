//! Multi-collector runner: one run per provider, merged into a system summary.
//!
//! Providers are isolated from each other. A provider whose source is down
//! shows up as an `UNREACHABLE` run summary; it never stops the others. There
//! are no retries at this level.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::orchestrator::{CollectProgress, Collector, RunStatus, RunSummary};

/// Latest outcome of every provider, as consumed by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSummary {
    pub generated_at: DateTime<Utc>,
    pub per_provider: BTreeMap<String, RunSummary>,
    pub overall_success_rate: f64,
}

impl SystemSummary {
    pub fn from_runs(runs: impl IntoIterator<Item = RunSummary>, generated_at: DateTime<Utc>) -> Self {
        let per_provider: BTreeMap<String, RunSummary> = runs
            .into_iter()
            .map(|run| (run.provider.clone(), run))
            .collect();
        let overall_success_rate = overall_success_rate(per_provider.values());
        Self {
            generated_at,
            per_provider,
            overall_success_rate,
        }
    }

    pub fn items_attempted(&self) -> usize {
        self.per_provider.values().map(|r| r.items_attempted).sum()
    }

    pub fn items_succeeded(&self) -> usize {
        self.per_provider.values().map(|r| r.items_succeeded).sum()
    }

    pub fn items_failed(&self) -> usize {
        self.per_provider.values().map(|r| r.items_failed).sum()
    }

    /// 2 if any provider was unreachable, 1 if any item failed, else 0.
    pub fn exit_code(&self) -> i32 {
        let statuses = self.per_provider.values().map(|r| r.status);
        let mut code = 0;
        for status in statuses {
            match status {
                RunStatus::Unreachable => return 2,
                RunStatus::Success => {}
                RunStatus::PartialFailure | RunStatus::Degraded => code = 1,
            }
        }
        code
    }
}

/// `Σ succeeded / Σ attempted` across runs; 1.0 when nothing was attempted.
pub fn overall_success_rate<'a>(runs: impl IntoIterator<Item = &'a RunSummary>) -> f64 {
    let (attempted, succeeded) = runs
        .into_iter()
        .fold((0usize, 0usize), |(a, s), r| (a + r.items_attempted, s + r.items_succeeded));
    if attempted == 0 {
        1.0
    } else {
        succeeded as f64 / attempted as f64
    }
}

/// Run every collector and merge their summaries.
pub fn run_all(
    collectors: &[Collector],
    parallel: bool,
    progress: Option<&dyn CollectProgress>,
) -> SystemSummary {
    info!(providers = collectors.len(), parallel, "starting collection run");

    let runs: Vec<RunSummary> = if parallel {
        collectors
            .par_iter()
            .map(|c| c.run_with_progress(progress))
            .collect()
    } else {
        collectors
            .iter()
            .map(|c| c.run_with_progress(progress))
            .collect()
    };

    let summary = SystemSummary::from_runs(runs, Utc::now());
    info!(
        attempted = summary.items_attempted(),
        succeeded = summary.items_succeeded(),
        success_rate = summary.overall_success_rate,
        "collection run finished"
    );
    summary
}
