//! Sliding-window rate limiting with burst allowance.
//!
//! Each `(category, identity)` pair owns a continuous window of request
//! timestamps plus a burst counter. Requests past `max_requests` draw on the
//! burst allowance until it is spent; after that the pair is denied until the
//! window slides.

use std::sync::Arc;

use crate::core::classifier::PolicyTable;
use crate::core::window::{capacity_left, remaining_after, retry_after};
use crate::models::WindowStatus;
use crate::store::{CounterStore, StoreError, WindowKey};
use crate::utils::now_ts;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub denied: bool,
    /// Seconds the caller should wait; 0 when admitted
    pub retry_after: u64,
    /// Advisory requests left under the base limit
    pub remaining: u64,
    pub limit: u32,
    pub burst_used: u64,
}

/// Rate limiter over a shared counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policies: Arc<PolicyTable>,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(store: Arc<dyn CounterStore>, policies: Arc<PolicyTable>) -> Self {
        Self { store, policies }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Check a request against its category and record it if admitted
    ///
    /// # Arguments
    ///
    /// * `category` - Policy category name; unknown names use the default policy
    /// * `identity` - Caller identity
    ///
    /// # Returns
    ///
    /// * `Ok(result)` with `denied` set when the window and burst are exhausted
    /// * `Err(StoreError)` if the store could not be reached in time
    pub async fn check_and_record(
        &self,
        category: &str,
        identity: &str,
    ) -> Result<RateLimitResult, StoreError> {
        self.check_and_record_at(category, identity, now_ts()).await
    }

    pub async fn check_and_record_at(
        &self,
        category: &str,
        identity: &str,
        now: f64,
    ) -> Result<RateLimitResult, StoreError> {
        let policy = self.policies.resolve(category);
        let key = WindowKey::new(&policy.name, identity);
        let outcome = self.store.check_and_record(&key, policy, now).await?;

        if !outcome.admitted {
            return Ok(RateLimitResult {
                denied: true,
                retry_after: retry_after(outcome.oldest, policy.window_seconds, now),
                remaining: 0,
                limit: policy.max_requests,
                burst_used: outcome.burst_used,
            });
        }

        Ok(RateLimitResult {
            denied: false,
            retry_after: 0,
            remaining: remaining_after(outcome.current, policy),
            limit: policy.max_requests,
            burst_used: outcome.burst_used,
        })
    }

    /// Current usage of a window without recording a request
    pub async fn status_at(
        &self,
        category: &str,
        identity: &str,
        now: f64,
    ) -> Result<WindowStatus, StoreError> {
        let policy = self.policies.resolve(category);
        let key = WindowKey::new(&policy.name, identity);
        let usage = self
            .store
            .window_usage(&key, policy.window_seconds, now)
            .await?;

        let reset_at = usage
            .oldest
            .map(|oldest| oldest + policy.window_seconds as f64)
            .unwrap_or(now);

        Ok(WindowStatus {
            endpoint: policy.name.clone(),
            limit: policy.max_requests,
            burst: policy.burst_allowance,
            window: policy.window_seconds,
            current_requests: usage.current,
            burst_used: usage.burst_used,
            remaining: capacity_left(usage.current, usage.burst_used, policy),
            reset_time: reset_at.ceil() as i64,
        })
    }

    /// Reset the window for a given key
    ///
    /// Returns true if the window or its burst counter existed.
    pub async fn reset(&self, category: &str, identity: &str) -> Result<bool, StoreError> {
        let policy = self.policies.resolve(category);
        self.store
            .reset_window(&WindowKey::new(&policy.name, identity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Config, PolicyCategory};
    use crate::store::MemoryStore;

    fn limiter(policy: PolicyCategory) -> RateLimiter {
        let mut config = Config::default().rate_limit;
        config.categories.insert(policy.name.clone(), policy);
        let table = PolicyTable::from_config(&config).unwrap();
        RateLimiter::new(Arc::new(MemoryStore::new()), Arc::new(table))
    }

    #[tokio::test]
    async fn test_burst_scenario() {
        let limiter = limiter(PolicyCategory::new("scenario", 5, 60, 2));
        let start = 10_000.0;

        let mut remaining = Vec::new();
        let mut burst = Vec::new();
        for i in 0..7 {
            let result = limiter
                .check_and_record_at("scenario", "203.0.113.1", start + f64::from(i) * 0.1)
                .await
                .unwrap();
            assert!(!result.denied, "request {} should be admitted", i + 1);
            remaining.push(result.remaining);
            burst.push(result.burst_used);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0, 0, 0]);
        assert_eq!(burst, vec![0, 0, 0, 0, 0, 1, 2]);

        let denied = limiter
            .check_and_record_at("scenario", "203.0.113.1", start + 0.8)
            .await
            .unwrap();
        assert!(denied.denied);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, 60);
    }

    #[tokio::test]
    async fn test_denied_until_window_slides() {
        let limiter = limiter(PolicyCategory::new("tight", 2, 10, 0));

        assert!(!limiter.check_and_record_at("tight", "a", 0.0).await.unwrap().denied);
        assert!(!limiter.check_and_record_at("tight", "a", 1.0).await.unwrap().denied);
        let denied = limiter.check_and_record_at("tight", "a", 5.0).await.unwrap();
        assert!(denied.denied);
        assert_eq!(denied.retry_after, 5);

        // Other identities and categories are independent
        assert!(!limiter.check_and_record_at("tight", "b", 5.0).await.unwrap().denied);
        assert!(!limiter.check_and_record_at("auth_login", "a", 5.0).await.unwrap().denied);

        // First entry slides out at t=10
        assert!(!limiter.check_and_record_at("tight", "a", 10.5).await.unwrap().denied);
        assert!(limiter.check_and_record_at("tight", "a", 10.6).await.unwrap().denied);
    }

    #[tokio::test]
    async fn test_reset_restores_full_allowance() {
        let limiter = limiter(PolicyCategory::new("tight", 1, 60, 1));
        limiter.check_and_record_at("tight", "a", 0.0).await.unwrap();
        limiter.check_and_record_at("tight", "a", 0.1).await.unwrap();
        assert!(limiter.check_and_record_at("tight", "a", 0.2).await.unwrap().denied);

        assert!(limiter.reset("tight", "a").await.unwrap());
        let fresh = limiter.check_and_record_at("tight", "a", 0.3).await.unwrap();
        let brand_new = limiter.check_and_record_at("tight", "z", 0.3).await.unwrap();
        assert_eq!(fresh, brand_new);
    }

    #[tokio::test]
    async fn test_unknown_category_uses_default_policy() {
        let limiter = limiter(PolicyCategory::new("tight", 1, 60, 0));
        let result = limiter
            .check_and_record_at("does_not_exist", "a", 0.0)
            .await
            .unwrap();
        assert_eq!(result.limit, 100);
        assert_eq!(result.remaining, 99);
    }

    #[tokio::test]
    async fn test_status_reports_usage() {
        let limiter = limiter(PolicyCategory::new("tight", 2, 60, 1));
        for i in 0..3 {
            limiter
                .check_and_record_at("tight", "a", 100.0 + f64::from(i))
                .await
                .unwrap();
        }
        let status = limiter.status_at("tight", "a", 103.0).await.unwrap();
        assert_eq!(status.endpoint, "tight");
        assert_eq!(status.current_requests, 3);
        assert_eq!(status.burst_used, 1);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_time, 160);
    }
}
