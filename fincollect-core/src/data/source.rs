//! Source client trait and structured fetch errors.
//!
//! A `SourceClient` abstracts over where raw records come from (CSV drops,
//! HTTP JSON APIs, test doubles) so the orchestrator can swap implementations
//! and mock them in tests.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RawRecord;

/// Inclusive date range requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The `days` days up to and including `end`.
    pub fn lookback(days: i64, end: NaiveDate) -> Self {
        Self {
            start: end - Duration::days(days.max(0)),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Fetch errors, split into transient (worth retrying) and permanent.
///
/// Displayable as-is in CLI output and run logs.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("no records returned for {entity}")]
    NoData { entity: String },

    #[error("hard stop: provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("fetch error: {0}")]
    Other(String),
}

impl FetchError {
    /// Transient errors may succeed on retry; everything else fails the item immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::NetworkUnreachable(_)
                | FetchError::Timeout(_)
                | FetchError::RateLimited { .. }
                | FetchError::ServerError { .. }
        )
    }

    /// Short machine-readable kind for run logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NetworkUnreachable(_) => "network_unreachable",
            FetchError::Timeout(_) => "timeout",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::ServerError { .. } => "server_error",
            FetchError::ResponseFormatChanged(_) => "format_changed",
            FetchError::AuthenticationRequired(_) => "auth_required",
            FetchError::EntityNotFound { .. } => "entity_not_found",
            FetchError::NoData { .. } => "no_data",
            FetchError::CircuitBreakerTripped => "circuit_breaker",
            FetchError::Other(_) => "other",
        }
    }
}

/// A provider of raw records.
///
/// Implementations handle one source's transport and parsing. Retries,
/// pacing and storage live above this trait.
pub trait SourceClient: Send + Sync {
    /// Provider name, used in logs, provenance and summaries.
    fn name(&self) -> &str;

    /// Fetch raw records for one entity over a date range.
    fn fetch(&self, entity_id: &str, range: &DateRange) -> Result<Vec<RawRecord>, FetchError>;

    /// Whether the source is currently accepting requests (not banned, not tripped).
    fn is_available(&self) -> bool;

    /// Request ceiling the orchestrator paces to. `None` means unpaced.
    fn requests_per_minute(&self) -> Option<u32> {
        None
    }
}
