//! Circuit breaker for provider bans and repeated failures.
//!
//! Trips immediately on a ban (HTTP 403) or once `failure_threshold` distinct
//! entities have failed since the last success, then refuses all requests for
//! a cooldown. Repeated attempts for one entity count once.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests allowed.
    Closed,
    /// Requests refused until the cooldown expires.
    Open { tripped_at: Instant },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failed_entities: HashSet<String>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failed_entities: HashSet::new(),
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// 30-minute cooldown, trips after 3 failing entities in a row.
    pub fn default_provider(name: impl Into<String>) -> Self {
        Self::new(name, Duration::from_secs(30 * 60), 3)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } if tripped_at.elapsed() >= self.cooldown => {
                inner.state = BreakerState::Closed;
                inner.failed_entities.clear();
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        self.lock().failed_entities.clear();
    }

    /// Record a failed request for `entity`. Only the first failure of each
    /// entity since the last success counts toward the threshold.
    pub fn record_failure(&self, entity: &str) {
        let mut inner = self.lock();
        if !inner.failed_entities.insert(entity.to_string()) {
            return;
        }
        let failures = inner.failed_entities.len() as u32;
        if failures >= self.failure_threshold && inner.state == BreakerState::Closed {
            warn!(
                provider = %self.name,
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker tripped"
            );
            inner.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    /// Trip immediately (ban).
    pub fn trip(&self) {
        warn!(provider = %self.name, "circuit breaker tripped by ban response");
        self.lock().state = BreakerState::Open {
            tripped_at: Instant::now(),
        };
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Zero when closed.
    pub fn remaining_cooldown(&self) -> Duration {
        match self.lock().state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => self.cooldown.saturating_sub(tripped_at.elapsed()),
        }
    }
}
