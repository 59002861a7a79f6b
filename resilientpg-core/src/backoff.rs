//! Deterministic, bounded, jittered retry delay schedule.

use std::time::Duration;

use rand::Rng;

/// Bounds passed to [`delay`] for a single retry/reconnect attempt.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    /// Delay never exceeds this, before jitter is added.
    pub max_delay: Duration,
    /// Upper bound (exclusive) on the uniform jitter added on top.
    pub max_jitter: Duration,
}

impl Bounds {
    pub const fn new(max_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_delay,
            max_jitter,
        }
    }
}

/// The reconnect loop's schedule: `maxDelay = 10s`, `maxJitter = 500ms`.
pub const RECONNECT: Bounds = Bounds::new(Duration::from_secs(10), Duration::from_millis(500));

/// The query/transaction executor's schedule: `maxDelay = 15s`, `maxJitter = 500ms`.
pub const EXECUTOR_RETRY: Bounds = Bounds::new(Duration::from_secs(15), Duration::from_millis(500));

const BASE: Duration = Duration::from_millis(1_000);

/// `min(base * 2^(attempt-1), maxDelay) + uniform(0, maxJitter)`.
///
/// `attempt` is 1-based. Exponential growth gives callers a much shorter
/// wait on the common case of a single transient blip while still
/// converging to `maxDelay`.
pub fn delay(attempt: u32, bounds: Bounds) -> Duration {
    delay_with_rng(attempt, bounds, &mut rand::thread_rng())
}

pub(crate) fn delay_with_rng(attempt: u32, bounds: Bounds, rng: &mut impl Rng) -> Duration {
    debug_assert!(attempt >= 1, "attempt numbering starts at 1");

    let exponent = attempt.saturating_sub(1).min(32);
    let scaled = BASE
        .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .unwrap_or(bounds.max_delay);
    let base_delay = scaled.min(bounds.max_delay);

    let jitter = if bounds.max_jitter.is_zero() {
        Duration::ZERO
    } else {
        rng.gen_range(Duration::ZERO..bounds.max_jitter)
    };

    base_delay + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn never_exceeds_max_delay_plus_max_jitter() {
        let bounds = Bounds::new(Duration::from_secs(10), Duration::from_millis(500));
        let mut rng = StepRng::new(u64::MAX / 2, 1);
        for attempt in 1..40 {
            let d = delay_with_rng(attempt, bounds, &mut rng);
            assert!(d <= bounds.max_delay + bounds.max_jitter, "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn grows_monotonically_before_the_cap() {
        let bounds = Bounds::new(Duration::from_secs(600), Duration::ZERO);
        let mut rng = StepRng::new(0, 1);
        let d1 = delay_with_rng(1, bounds, &mut rng);
        let d2 = delay_with_rng(2, bounds, &mut rng);
        let d3 = delay_with_rng(3, bounds, &mut rng);
        assert!(d1 <= d2 && d2 <= d3);
    }

    #[test]
    fn attempt_one_is_base_delay_with_no_jitter_floor() {
        let bounds = Bounds::new(Duration::from_secs(10), Duration::ZERO);
        let mut rng = StepRng::new(0, 1);
        assert_eq!(delay_with_rng(1, bounds, &mut rng), BASE);
    }
}
