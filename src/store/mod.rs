//! Counter store abstraction behind the admission layer.
//!
//! Every mutation the admission pipeline performs goes through one call on
//! [`CounterStore`], so a backend can make it atomic. Two backends exist:
//! [`RedisStore`] shared by all service instances, and [`MemoryStore`] for a
//! single process.

pub mod memory_store;
pub mod redis_store;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::classifier::PolicyTable;
use crate::models::{BanRecord, PolicyCategory};

pub use self::memory_store::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by a counter store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Composite `(category, identity)` key of a sliding window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub category: String,
    pub identity: String,
}

impl WindowKey {
    pub fn new(category: &str, identity: &str) -> Self {
        Self {
            category: category.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.identity)
    }
}

/// Raw result of an atomic check-and-record
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Entries in the window before this request
    pub current: u64,
    /// Burst counter after this request
    pub burst_used: u64,
    /// Timestamp of the oldest in-window entry
    pub oldest: Option<f64>,
}

/// Window contents read without recording anything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowUsage {
    pub current: u64,
    pub burst_used: u64,
    pub oldest: Option<f64>,
}

/// Entry count of one live window, for operator statistics
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub key: WindowKey,
    pub count: u64,
}

/// Shared state for windows, burst counters, DDoS logs and bans.
///
/// Timestamps are Unix seconds with fractions and are supplied by the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for readiness output
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Trim the window, evaluate the policy and record the request if admitted
    async fn check_and_record(
        &self,
        key: &WindowKey,
        policy: &PolicyCategory,
        now: f64,
    ) -> Result<WindowOutcome, StoreError>;

    /// Trim the window and report its usage
    async fn window_usage(
        &self,
        key: &WindowKey,
        window_seconds: u64,
        now: f64,
    ) -> Result<WindowUsage, StoreError>;

    /// Delete the window and its burst counter; true if anything existed
    async fn reset_window(&self, key: &WindowKey) -> Result<bool, StoreError>;

    /// Append to the identity's DDoS log and return the in-window count
    async fn record_hit(
        &self,
        identity: &str,
        window_seconds: u64,
        now: f64,
    ) -> Result<u64, StoreError>;

    async fn hit_count(
        &self,
        identity: &str,
        window_seconds: u64,
        now: f64,
    ) -> Result<u64, StoreError>;

    /// Store a ban that expires on its own after `duration_seconds`
    async fn put_ban(&self, record: &BanRecord) -> Result<(), StoreError>;

    async fn get_ban(&self, identity: &str, now: f64) -> Result<Option<BanRecord>, StoreError>;

    async fn delete_ban(&self, identity: &str) -> Result<bool, StoreError>;

    /// Non-empty windows, counting only entries inside each category's window at `now`
    async fn active_windows(
        &self,
        policies: &PolicyTable,
        now: f64,
    ) -> Result<Vec<WindowSnapshot>, StoreError>;

    async fn ban_count(&self, now: f64) -> Result<u64, StoreError>;

    /// Drop entries older than `max_window_seconds` and expired bans
    async fn purge_expired(&self, max_window_seconds: u64, now: f64) -> Result<u64, StoreError>;
}
