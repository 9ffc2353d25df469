//! fincollect runner: collection orchestration on top of `fincollect-core`.
//!
//! - TOML collection configuration, validated at load
//! - Per-provider collector (fetch, validate, normalize, score, write)
//! - Multi-provider runs merged into a system summary
//! - JSONL run log and the latest system summary on disk

pub mod config;
pub mod multi;
pub mod orchestrator;
pub mod run_log;

pub use config::{
    CollectionConfig, ConfigError, Defaults, InvalidRecordPolicy, ItemConfig, ProviderConfig,
    SourceConfig, StorageConfig,
};
pub use multi::{overall_success_rate, run_all, SystemSummary};
pub use orchestrator::{
    normalize_stage, score_stage, validate_stage, CollectProgress, Collector, ItemError,
    ItemOutcome, RetryRecord, RunStatus, RunSummary, Stage, StdoutProgress, ValidatedBatch,
};
pub use run_log::{read_system_summary, write_system_summary, RunLog, RunLogError};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn collector_is_send_sync() {
        assert_send::<Collector>();
        assert_sync::<Collector>();
    }

    #[test]
    fn summaries_are_send_sync() {
        assert_send::<RunSummary>();
        assert_sync::<RunSummary>();
        assert_send::<SystemSummary>();
        assert_sync::<SystemSummary>();
        assert_send::<ItemOutcome>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<CollectionConfig>();
        assert_sync::<CollectionConfig>();
    }
}
