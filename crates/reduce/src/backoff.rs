//! Host penalties, escalation and the shuffle kill decision.
//!
//! All functions here are pure so the scheduler's failure policy can be
//! tested without a runtime.

use std::time::Duration;

/// Lowest retry threshold regardless of configuration.
pub const MIN_FETCH_RETRIES_PER_PRODUCER: u32 = 2;
/// Failure ratio at or above which the reducer is considered unhealthy.
pub const MAX_ALLOWED_FAILED_FETCH_FRACTION: f64 = 0.5;
/// Copied fraction below which the reducer has not progressed enough.
pub const MIN_REQUIRED_PROGRESS_FRACTION: f64 = 0.5;
/// Stall fraction at or above which the reducer is considered stalled.
pub const MAX_ALLOWED_STALL_FRACTION: f64 = 0.5;

/// Exponent of the power of two closest to `value`; `0` for `0`.
#[must_use]
pub fn closest_pow2(value: u64) -> u32 {
    if value == 0 {
        return 0;
    }
    let hob = 1_u64 << (63 - value.leading_zeros());
    hob.trailing_zeros() + u32::from((hob >> 1) & value != 0)
}

fn threshold_for(span: Duration, base: Duration) -> u32 {
    let base_ms = base.as_millis().max(1);
    let ratio = (span.as_millis() / base_ms).min(u64::MAX as u128 - 1) as u64;
    closest_pow2(ratio + 1).max(MIN_FETCH_RETRIES_PER_PRODUCER)
}

/// Retry threshold before any producer runtime is known.
#[must_use]
pub fn initial_retry_threshold(base: Duration, max_backoff: Duration) -> u32 {
    threshold_for(max_backoff, base)
}

/// Retry threshold implied by the longest producer runtime seen so far.
#[must_use]
pub fn widened_threshold(max_runtime: Duration, base: Duration) -> u32 {
    threshold_for(max_runtime, base)
}

/// Penalty applied to a host after the `failures`-th consecutive failure of
/// one attempt: `base × 2^(failures−1)` up to the threshold, then half the
/// maximum backoff.
#[must_use]
pub fn penalty(failures: u32, threshold: u32, base: Duration, max_backoff: Duration) -> Duration {
    if failures <= threshold {
        let exp = failures.saturating_sub(1).min(31);
        base.saturating_mul(1_u32 << exp)
    } else {
        max_backoff / 2
    }
}

/// Whether the `failures`-th failure is reported to the coordinator.
#[must_use]
pub fn should_escalate(failures: u32, threshold: u32) -> bool {
    failures >= threshold && (failures - threshold) % 2 == 0
}

/// Inputs of the kill decision taken when an attempt reaches the retry threshold.
#[derive(Debug, Clone, Copy)]
pub struct KillCheck {
    pub permanently_failed: usize,
    pub unique_failure_cap: usize,
    pub total: usize,
    pub copied: usize,
    pub total_failures: u64,
    /// Time since the last successful copy.
    pub stall: Duration,
    /// Time from start to the last successful copy.
    pub progress_duration: Duration,
    pub max_producer_runtime: Duration,
}

impl KillCheck {
    #[must_use]
    pub fn should_abort(&self) -> bool {
        let remaining = self.total.saturating_sub(self.copied);
        let enough_failed = self.permanently_failed >= self.unique_failure_cap
            || self.permanently_failed == remaining;

        let attempts = self.total_failures + self.copied as u64;
        let unhealthy = attempts > 0
            && self.total_failures as f64 / attempts as f64 >= MAX_ALLOWED_FAILED_FETCH_FRACTION;

        let progressed = self.total > 0
            && self.copied as f64 / self.total as f64 >= MIN_REQUIRED_PROGRESS_FRACTION;

        let window = self.progress_duration.max(self.max_producer_runtime);
        let stalled = if window.is_zero() {
            !self.stall.is_zero()
        } else {
            self.stall.as_secs_f64() / window.as_secs_f64() >= MAX_ALLOWED_STALL_FRACTION
        };

        enough_failed && unhealthy && (!progressed || stalled)
    }
}
