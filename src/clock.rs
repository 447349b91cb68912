//! Monotonic wall-clock time and jitter PRNG.
//!
//! The rest of the crate never calls `SystemTime::now()` or `rand::thread_rng()`
//! directly so that timing-sensitive gates (loop breaker, circuit breaker,
//! lock leases) stay testable through a single seam.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Uniform jitter factor in `[-1.0, 1.0]`, used by the retry engine's backoff
/// calculation (`1 + U(-1,1) * jitterRatio`).
pub fn jitter_unit() -> f64 {
    rand::Rng::gen_range(&mut rand::thread_rng(), -1.0..=1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonically_nondecreasing_across_calls() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn jitter_unit_stays_in_range() {
        for _ in 0..1000 {
            let j = jitter_unit();
            assert!((-1.0..=1.0).contains(&j));
        }
    }

}
