//! Time-boxed deny list.
//!
//! A ban is one store entry per identity whose TTL equals its duration, so
//! bans lapse without any sweeper. Whitelisted identities never reach this
//! registry.

use std::sync::Arc;

use log::info;
use metrics::counter;

use crate::models::BanRecord;
use crate::store::{CounterStore, StoreError};
use crate::utils::{datetime_from_ts, sanitize_for_logging};

pub const DDOS_BAN_REASON: &str = "ddos_detected";

pub struct BanRegistry {
    store: Arc<dyn CounterStore>,
}

impl BanRegistry {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Active ban for `identity`, if any
    pub async fn is_banned(
        &self,
        identity: &str,
        now: f64,
    ) -> Result<Option<BanRecord>, StoreError> {
        let record = self.store.get_ban(identity, now).await?;
        Ok(record.filter(|r| r.is_active(now)))
    }

    pub async fn ban(
        &self,
        identity: &str,
        duration_seconds: u64,
        reason: &str,
        now: f64,
    ) -> Result<BanRecord, StoreError> {
        let record = BanRecord {
            identity: identity.to_string(),
            reason: reason.to_string(),
            banned_at: datetime_from_ts(now),
            duration_seconds,
        };
        self.store.put_ban(&record).await?;

        let metric_reason = if reason == DDOS_BAN_REASON {
            DDOS_BAN_REASON
        } else {
            "manual"
        };
        counter!("admission_bans_total", 1, "reason" => metric_reason);
        info!(
            "Banned {} for {} seconds. Reason: {}",
            sanitize_for_logging(identity),
            duration_seconds,
            sanitize_for_logging(reason)
        );
        Ok(record)
    }

    /// Lift a ban early; false if none was active
    pub async fn unban(&self, identity: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete_ban(identity).await?;
        if removed {
            info!("Unbanned {}", sanitize_for_logging(identity));
        }
        Ok(removed)
    }

    pub async fn count(&self, now: f64) -> Result<u64, StoreError> {
        self.store.ban_count(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_ban_lifecycle() {
        let registry = BanRegistry::new(Arc::new(MemoryStore::new()));

        assert!(registry.is_banned("192.168.1.100", 0.0).await.unwrap().is_none());

        let record = registry
            .ban("192.168.1.100", 60, "test ban", 0.0)
            .await
            .unwrap();
        let active = registry.is_banned("192.168.1.100", 10.0).await.unwrap();
        assert_eq!(active, Some(record.clone()));
        assert_eq!(record.remaining_seconds(10.0), 50);
        assert_eq!(registry.count(10.0).await.unwrap(), 1);

        assert!(registry.unban("192.168.1.100").await.unwrap());
        assert!(!registry.unban("192.168.1.100").await.unwrap());
        assert!(registry.is_banned("192.168.1.100", 11.0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let registry = BanRegistry::new(Arc::new(MemoryStore::new()));
        registry
            .ban("192.168.1.101", 30, DDOS_BAN_REASON, 100.0)
            .await
            .unwrap();
        assert!(registry.is_banned("192.168.1.101", 129.0).await.unwrap().is_some());
        assert!(registry.is_banned("192.168.1.101", 130.5).await.unwrap().is_none());
    }
}
