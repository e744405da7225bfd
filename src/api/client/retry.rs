//! Retry policy for opening a model stream.
//!
//! Only the connection phase is retried. Once bytes start flowing, a failure
//! belongs to the run and is reported to the caller.

use crate::error::ApiError;
use std::time::Duration;

/// Bounded retry policy used by `HttpModelClient`.
#[derive(Clone, Copy, Debug)]
pub(super) struct RetryPolicy {
    /// Upper bound on total attempts, including the initial request.
    pub(super) max_attempts: u32,
    pub(super) initial_backoff: Duration,
    pub(super) max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Longest server-requested wait we honour.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

impl RetryPolicy {
    /// Whether `err`, seen on zero-based `attempt`, earns another try.
    pub(super) fn should_retry(&self, err: &ApiError, attempt: u32) -> bool {
        let attempts_made = attempt.saturating_add(1);
        attempts_made < self.max_attempts && is_transient(err)
    }

    /// Wait before the next attempt. A `Retry-After` hint replaces the
    /// exponential schedule.
    pub(super) fn delay_for(&self, attempt: u32, err: &ApiError) -> Duration {
        if let Some(seconds) = err.retry_after_secs() {
            return Duration::from_secs(seconds.max(1)).min(MAX_RETRY_AFTER);
        }
        self.initial_backoff
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

fn is_transient(err: &ApiError) -> bool {
    match err {
        ApiError::Http(inner) => inner.is_timeout() || inner.is_connect(),
        // Rate limits, server errors and the provider's 529 "overloaded".
        ApiError::Status { code, .. } => matches!(*code, 429 | 500..=599),
        ApiError::InvalidResponse(_) => false,
    }
}
