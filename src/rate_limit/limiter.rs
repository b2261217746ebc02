use crate::errors::{AppError, Result};
use crate::rate_limit::policy::Policy;
use crate::rate_limit::store::{RequestRecord, WindowStore};
use std::sync::Arc;

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// The rate limit (max requests per window)
    pub limit: u32,
    /// Number of requests remaining in the current window
    pub remaining: u32,
    /// When the window resets, milliseconds since the Unix epoch
    pub reset_time_ms: u64,
    /// Requests counted in the window, this one included
    pub total_in_window: u32,
}

impl RateLimitResult {
    /// Reset time as unix seconds, rounded up, for the reset header
    pub fn reset_unix_seconds(&self) -> u64 {
        (self.reset_time_ms + 999) / 1000
    }

    /// Whole seconds until the window resets, never negative
    pub fn retry_after_seconds(&self, now_ms: u64) -> u64 {
        let delta = self.reset_time_ms.saturating_sub(now_ms);
        (delta + 999) / 1000
    }
}

/// Sliding-window admission algorithm over a shared `WindowStore`.
///
/// The count reflects exactly the trailing window, not an aligned bucket,
/// so a burst cannot double up across a bucket boundary. The whole
/// read-modify-write runs inside `WindowStore::apply`, which serializes
/// concurrent decisions for the same key.
pub struct SlidingWindowLimiter {
    store: Arc<WindowStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<WindowStore>) -> Self {
        Self { store }
    }

    /// Decide admission for `key` under `policy` as of `now_ms`, recording
    /// the outcome in the key's ledger.
    pub fn check(&self, key: &str, policy: &Policy, now_ms: u64) -> Result<RateLimitResult> {
        let window_ms = policy.window_millis();
        let window_start_ms = now_ms.saturating_sub(window_ms);

        let result = self
            .store
            .apply(key, now_ms, window_ms, |entry| {
                entry.prune(window_start_ms);

                let prior = if policy.skip_successful {
                    entry.requests.iter().filter(|r| !r.success).count()
                } else {
                    entry.requests.len()
                };
                // The current request is tentatively included in the count.
                let countable = prior as u32 + 1;
                let allowed = countable <= policy.max_requests;

                entry.requests.push(RequestRecord {
                    timestamp_ms: now_ms,
                    success: allowed,
                });

                // Bound the ledger to twice the quota, dropping the oldest.
                let cap = policy.max_requests as usize * 2;
                if entry.requests.len() > cap {
                    let overflow = entry.requests.len() - cap;
                    entry.requests.drain(..overflow);
                }

                entry.reset_time_ms = entry.reset_time_ms.max(now_ms + window_ms);

                RateLimitResult {
                    allowed,
                    limit: policy.max_requests,
                    remaining: policy.max_requests.saturating_sub(countable),
                    reset_time_ms: entry.reset_time_ms,
                    total_in_window: countable,
                }
            })
            .map_err(|e| AppError::Store(e.to_string()))?;

        tracing::debug!(
            key = %key,
            allowed = %result.allowed,
            total_in_window = %result.total_in_window,
            remaining = %result.remaining,
            "Rate limit check result"
        );

        Ok(result)
    }
}
