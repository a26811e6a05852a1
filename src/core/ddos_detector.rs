//! Flood detection across all endpoint categories.
//!
//! The detector keeps one sliding log of request timestamps per identity,
//! regardless of category. Reaching the threshold inside the window signals a
//! ban; the admission controller turns that into a [`BanRecord`](crate::models::BanRecord).

use std::sync::Arc;

use crate::models::DdosConfig;
use crate::store::{CounterStore, StoreError};
use crate::utils::now_ts;

/// DDoS detector implementation
pub struct DdosDetector {
    store: Arc<dyn CounterStore>,
    threshold: u64,
    window_seconds: u64,
}

impl DdosDetector {
    /// Create a new DDoS detector instance
    pub fn new(store: Arc<dyn CounterStore>, config: &DdosConfig) -> Self {
        Self {
            store,
            threshold: config.threshold,
            window_seconds: config.window_seconds,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Record a request from `identity`, returning the in-window count
    pub async fn record(&self, identity: &str) -> Result<u64, StoreError> {
        self.record_at(identity, now_ts()).await
    }

    pub async fn record_at(&self, identity: &str, now: f64) -> Result<u64, StoreError> {
        self.store
            .record_hit(identity, self.window_seconds, now)
            .await
    }

    /// Check whether `identity` has reached the flood threshold
    ///
    /// # Returns
    ///
    /// * `Ok(false)` if the identity is under the threshold
    /// * `Ok(true)` if the identity should be banned
    /// * `Err(StoreError)` if the store could not be reached
    pub async fn should_ban(&self, identity: &str) -> Result<bool, StoreError> {
        self.should_ban_at(identity, now_ts()).await
    }

    pub async fn should_ban_at(&self, identity: &str, now: f64) -> Result<bool, StoreError> {
        let count = self
            .store
            .hit_count(identity, self.window_seconds, now)
            .await?;
        Ok(count >= self.threshold)
    }

    /// Record and evaluate in one store round trip
    pub async fn record_and_evaluate_at(
        &self,
        identity: &str,
        now: f64,
    ) -> Result<bool, StoreError> {
        let count = self.record_at(identity, now).await?;
        Ok(count >= self.threshold)
    }
}
