//! Per-category rate limiting for batches copied from SOURCE, tunable
//! by performance category.
//!
//! This is deliberately simple: a minimum spacing between successive
//! batches, tracked per category with an `Instant`. No token bucket or
//! external crate is warranted at this scale — a short sleep between
//! batches is all that's needed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::PerformanceCategory;

/// Minimum spacing between SOURCE batches, tunable per category. Larger
/// tables get a shorter gap since they already pay for pagination
/// overhead; tiny tables get a longer gap since a run over many tiny
/// tables would otherwise hammer SOURCE with no benefit.
fn default_interval(category: PerformanceCategory) -> Duration {
    match category {
        PerformanceCategory::Tiny => Duration::from_millis(250),
        PerformanceCategory::Small => Duration::from_millis(150),
        PerformanceCategory::Medium => Duration::from_millis(75),
        PerformanceCategory::Large => Duration::from_millis(25),
    }
}

/// Tracks last-batch timestamps per category and sleeps just enough to
/// respect the configured interval before the next batch proceeds.
pub struct RateLimiter {
    intervals: HashMap<PerformanceCategory, Duration>,
    last_run: Mutex<HashMap<PerformanceCategory, Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        let mut intervals = HashMap::new();
        for category in PerformanceCategory::ALL {
            intervals.insert(category, default_interval(category));
        }
        Self {
            intervals,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_interval(mut self, category: PerformanceCategory, interval: Duration) -> Self {
        self.intervals.insert(category, interval);
        self
    }

    /// Sleeps (if needed) so that the gap since the previous call for
    /// `category` is at least the configured interval, then records
    /// this call's timestamp. Honors `cancel` during the sleep.
    pub async fn throttle(&self, category: PerformanceCategory, cancel: &crate::cancel::CancelHandle) {
        let interval = *self.intervals.get(&category).unwrap_or(&Duration::ZERO);
        if interval.is_zero() {
            return;
        }

        let wait = {
            let mut last_run = self
                .last_run
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Instant::now();
            let wait = last_run
                .get(&category)
                .and_then(|prev| interval.checked_sub(now.duration_since(*prev)))
                .unwrap_or(Duration::ZERO);
            last_run.insert(category, now + wait);
            wait
        };

        if wait.is_zero() {
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;

    #[tokio::test]
    async fn second_call_within_interval_waits() {
        let limiter = RateLimiter::new().with_interval(
            PerformanceCategory::Large,
            Duration::from_millis(40),
        );
        let cancel = CancelHandle::new();

        let start = Instant::now();
        limiter.throttle(PerformanceCategory::Large, &cancel).await;
        limiter.throttle(PerformanceCategory::Large, &cancel).await;
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let limiter = RateLimiter::new().with_interval(PerformanceCategory::Tiny, Duration::ZERO);
        let cancel = CancelHandle::new();
        let start = Instant::now();
        limiter.throttle(PerformanceCategory::Tiny, &cancel).await;
        limiter.throttle(PerformanceCategory::Tiny, &cancel).await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
