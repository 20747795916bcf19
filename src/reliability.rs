//! Backoff-delay helpers shared by step retries and execution retries.
//! The engine's two retry loops use different, spec-fixed formulas
//! (unlike the donor crate's fully configurable `RetryPolicy`), so this
//! module is two small free functions rather than a policy struct.

use std::time::Duration;

/// Per-step retry backoff: `100 * 2^attempt` ms, per §4.6 "Step
/// semantics". `attempt` is 0-based (the first retry after the initial
/// failed attempt passes `attempt = 0`).
pub fn step_retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(100u64.saturating_mul(1u64 << attempt.min(20)))
}

/// Per-execution retry backoff: `2^attempt` seconds, per §4.7
/// "runExecutionAttempt" (`now + 2^attempt · 1s`). `attempt` is the
/// execution's current (1-based) attempt number before it is bumped.
pub fn execution_retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64.saturating_mul(1u64 << attempt.min(20)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_retry_delay_doubles() {
        assert_eq!(step_retry_delay(0), Duration::from_millis(100));
        assert_eq!(step_retry_delay(1), Duration::from_millis(200));
        assert_eq!(step_retry_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn execution_retry_delay_matches_s3_scenario() {
        // S3: after attempt 1 fails, retry fires at +2s; after attempt 2
        // fails, retry fires at +4s.
        assert_eq!(execution_retry_delay(1), Duration::from_secs(2));
        assert_eq!(execution_retry_delay(2), Duration::from_secs(4));
    }
}
