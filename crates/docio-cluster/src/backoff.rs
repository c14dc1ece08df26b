//! Exponential backoff with jitter for cross-node retries

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            current: initial,
            initial,
            max: max.max(initial),
        }
    }

    #[must_use]
    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        )
    }

    /// Next delay: the current step plus up to 25% jitter, then double
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 4);
        self.current = self.current.saturating_mul(2).min(self.max);
        base.saturating_add(Duration::from_millis(jitter_ms)).min(self.max)
    }

    /// Sleep for the next delay, never past `deadline`
    ///
    /// Returns false without sleeping if the deadline already passed.
    pub async fn wait_until(&mut self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let delay = self.next_delay().min(deadline - now);
        tokio::time::sleep(delay).await;
        true
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
