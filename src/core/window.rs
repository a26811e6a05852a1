//! Sliding-window and burst arithmetic shared by every store backend.
//!
//! The Redis script in `store::redis_store` mirrors [`evaluate`] line for line; keep
//! them in step.

use crate::models::PolicyCategory;

/// Outcome of evaluating one request against a window's current contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Record the request; `uses_burst` means the burst counter is incremented
    Admit { uses_burst: bool },
    Deny,
}

/// Decide a request given the in-window count and the burst already used
pub fn evaluate(current: u64, burst_used: u64, policy: &PolicyCategory) -> WindowDecision {
    let max_requests = u64::from(policy.max_requests);
    if current < max_requests {
        return WindowDecision::Admit { uses_burst: false };
    }

    // Burst entries stay in the window, so the spent count is tracked separately
    if burst_used >= u64::from(policy.burst_allowance) {
        return WindowDecision::Deny;
    }
    WindowDecision::Admit { uses_burst: true }
}

/// Requests a window can still take: base allowance left plus unspent burst
pub fn capacity_left(current: u64, burst_used: u64, policy: &PolicyCategory) -> u64 {
    u64::from(policy.max_requests).saturating_sub(current)
        + u64::from(policy.burst_allowance).saturating_sub(burst_used)
}

/// Requests left under the base limit after admitting one at `current`
pub fn remaining_after(current: u64, policy: &PolicyCategory) -> u64 {
    u64::from(policy.max_requests).saturating_sub(current + 1)
}

/// Seconds until the oldest in-window entry slides out
pub fn retry_after(oldest: Option<f64>, window_seconds: u64, now: f64) -> u64 {
    match oldest {
        Some(oldest) => {
            let left = (oldest + window_seconds as f64 - now).ceil();
            if left < 1.0 {
                1
            } else {
                left as u64
            }
        }
        None => window_seconds.max(1),
    }
}

/// Lower bound (exclusive) of the window ending at `now`
pub fn window_start(now: f64, window_seconds: u64) -> f64 {
    now - window_seconds as f64
}
