//! Retry backoff policy.

use chrono::{DateTime, Duration, Utc};
use fm_core::config::RetryConfig;
use fm_core::types::Dispatch;

/// Delay before attempt `retries + 1`: exponential in the retry count,
/// capped at the configured maximum.
pub fn backoff_delay(retries: u32, base_secs: i64, max_secs: i64) -> Duration {
    let shift = retries.min(31);
    let raw = base_secs.saturating_mul(1_i64 << shift);
    Duration::seconds(raw.min(max_secs))
}

/// True when the backoff window since `completed_at` has elapsed.
pub fn should_retry(
    completed_at: DateTime<Utc>,
    retries: u32,
    base_secs: i64,
    max_secs: i64,
    now: DateTime<Utc>,
) -> bool {
    now.signed_duration_since(completed_at) >= backoff_delay(retries, base_secs, max_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Backoff elapsed and budget remains — redispatch.
    Go,
    /// Still inside the backoff window.
    NotYet,
    /// Retry budget exhausted — terminal failure.
    Exhausted,
}

pub fn retry_verdict(dispatch: &Dispatch, cfg: &RetryConfig, now: DateTime<Utc>) -> RetryVerdict {
    if dispatch.retries >= cfg.max_retries {
        return RetryVerdict::Exhausted;
    }
    let completed = dispatch.completed_at.unwrap_or(dispatch.dispatched_at);
    if should_retry(
        completed,
        dispatch.retries,
        cfg.backoff_base_secs,
        cfg.max_delay_secs,
        now,
    ) {
        RetryVerdict::Go
    } else {
        RetryVerdict::NotYet
    }
}
