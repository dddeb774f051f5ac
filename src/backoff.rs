//! Retry delay strategies.
//!
//! A backoff maps the number of failed attempts so far (starting at 1) to
//! the delay before the job is delivered again.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const DEFAULT_BASE_MS: u64 = 500;
const DEFAULT_CAP_MS: u64 = 30_000;

/// `min(30s, 500ms * 2^(attempt-1))` plus up to 25% jitter.
pub fn default_backoff(attempt: u32) -> Duration {
    let base = exponential_ms(attempt, DEFAULT_BASE_MS, DEFAULT_CAP_MS);
    let jitter = (base as f64 * 0.25 * unit_random()) as u64;
    Duration::from_millis(base + jitter)
}

/// Exponential backoff without jitter.
pub fn exponential(base: Duration, cap: Duration) -> Backoff {
    let base = base.as_millis() as u64;
    let cap = cap.as_millis() as u64;
    Arc::new(move |attempt| Duration::from_millis(exponential_ms(attempt, base, cap)))
}

/// The same delay after every failure.
pub fn fixed(delay: Duration) -> Backoff {
    Arc::new(move |_| delay)
}

fn exponential_ms(attempt: u32, base: u64, cap: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base.saturating_mul(1u64 << shift).min(cap)
}

/// Uniform in `[0, 1)`, taken from the random bits of a v4 uuid.
fn unit_random() -> f64 {
    (Uuid::new_v4().as_u128() >> 75) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_with_jitter() {
        for (attempt, base) in [(1, 500), (2, 1_000), (3, 2_000), (10, 30_000)] {
            let delay = default_backoff(attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 4, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn exponential_is_capped() {
        let backoff = exponential(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(2), Duration::from_millis(200));
        assert_eq!(backoff(3), Duration::from_millis(350));
        assert_eq!(backoff(40), Duration::from_millis(350));
    }
}
