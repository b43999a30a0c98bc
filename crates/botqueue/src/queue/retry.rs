use rand::Rng;
use std::time::Duration;

/// Upper bound for `jitter_pct`. Below 1/3 the jittered delay for attempt n+1
/// can never undercut the one for attempt n, so backoff stays non-decreasing.
pub const MAX_JITTER_PCT: f64 = 0.30;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15 * 60),
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Requeue(Duration),
    DeadLetter,
}

impl RetryPolicy {
    /// Policy without jitter. Handy for deterministic tests.
    pub fn fixed(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_pct: 0.0,
        }
    }

    /// What to do with an item whose execution just failed.
    ///
    /// `attempt_count` is the number of failures recorded *before* this one.
    pub fn decide(&self, attempt_count: i32, max_attempts: i32) -> Decision {
        self.decide_with_rng(attempt_count, max_attempts, &mut rand::thread_rng())
    }

    pub fn decide_with_rng(
        &self,
        attempt_count: i32,
        max_attempts: i32,
        rng: &mut impl Rng,
    ) -> Decision {
        if attempt_count.saturating_add(1) >= max_attempts {
            return Decision::DeadLetter;
        }
        Decision::Requeue(self.delay_with_rng(attempt_count, rng))
    }

    /// `base_delay * 2^attempt_count`, jittered, then capped at `max_delay`.
    pub fn delay_with_rng(&self, attempt_count: i32, rng: &mut impl Rng) -> Duration {
        let exp = attempt_count.max(0) as u32;
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        // 2^exp, saturating; the cap takes care of anything huge
        let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
        let raw_ms = base_ms.saturating_mul(pow2) as f64;

        let jitter_pct = self.jitter_pct.clamp(0.0, MAX_JITTER_PCT);
        let jittered = if jitter_pct > 0.0 && raw_ms > 0.0 {
            let range = raw_ms * jitter_pct;
            raw_ms + rng.gen_range(-range..=range)
        } else {
            raw_ms
        };

        let capped = jittered.round().clamp(0.0, max_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff for retrying a failing storage call (not a task retry).
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.delay_with_rng(exp, &mut rand::thread_rng())
    }
}
