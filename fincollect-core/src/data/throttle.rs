use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Delay-based request pacing at a requests-per-minute ceiling.
///
/// Backed by a `governor` direct limiter with a burst of one, so a shared
/// throttle spaces requests evenly across threads. `None` means unpaced.
pub struct Throttle {
    interval: Duration,
    limiter: Option<Limiter>,
    clock: DefaultClock,
}

impl Throttle {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        match NonZeroU32::new(requests_per_minute) {
            Some(rpm) => Self::from_quota(
                Duration::from_secs(60) / rpm.get(),
                Quota::per_minute(rpm).allow_burst(NonZeroU32::MIN),
            ),
            None => Self::unpaced(),
        }
    }

    pub fn with_interval(interval: Duration) -> Self {
        match Quota::with_period(interval) {
            Some(quota) => Self::from_quota(interval, quota),
            None => Self::unpaced(),
        }
    }

    pub fn unpaced() -> Self {
        Self {
            interval: Duration::ZERO,
            limiter: None,
            clock: DefaultClock::default(),
        }
    }

    fn from_quota(interval: Duration, quota: Quota) -> Self {
        Self {
            interval,
            limiter: Some(RateLimiter::direct(quota)),
            clock: DefaultClock::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the caller may issue a request. Returns the time slept.
    pub fn wait(&self) -> Duration {
        let Some(limiter) = &self.limiter else {
            return Duration::ZERO;
        };
        let mut waited = Duration::ZERO;
        while let Err(not_until) = limiter.check() {
            let delay = not_until.wait_time_from(self.clock.now());
            std::thread::sleep(delay);
            waited += delay;
        }
        waited
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("interval", &self.interval)
            .field("paced", &self.limiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn first_request_is_free() {
        let t = Throttle::with_interval(Duration::from_millis(50));
        assert_eq!(t.wait(), Duration::ZERO);
    }

    #[test]
    fn consecutive_requests_are_spaced() {
        let t = Throttle::with_interval(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..3 {
            t.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(38));
    }

    #[test]
    fn per_minute_interval() {
        assert_eq!(Throttle::per_minute(120).interval(), Duration::from_millis(500));
        assert_eq!(Throttle::per_minute(0).interval(), Duration::ZERO);
        assert_eq!(Throttle::unpaced().wait(), Duration::ZERO);
        assert_eq!(Throttle::with_interval(Duration::ZERO).wait(), Duration::ZERO);
    }

    #[test]
    fn high_rate_does_not_block_first_call() {
        let t = Throttle::per_minute(6000);
        assert_eq!(t.wait(), Duration::ZERO);
    }

    #[test]
    fn shared_across_threads() {
        let t = std::sync::Arc::new(Throttle::with_interval(Duration::from_millis(10)));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || {
                    t.wait();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(28));
    }
}
