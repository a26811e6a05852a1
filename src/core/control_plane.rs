//! Operator operations over the admission state.
//!
//! Shares the store and policy table with the request path through the
//! [`AdmissionController`]. Every input is validated before the store is
//! touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::info;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::core::admission::AdmissionController;
use crate::core::identity::IdentityKey;
use crate::models::{
    AdminConfig, AdmissionStats, BanRecord, Config, OffenderSummary, PolicyCategory, WindowStatus,
};
use crate::store::{StoreError, WindowSnapshot};
use crate::utils::{is_valid_identifier, now_ts, sanitize_for_logging};

const STATS_TOP_IPS: usize = 5;
const MAX_REASON_LEN: usize = 200;

/// Errors returned to operators
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("unknown endpoint category: {0}")]
    UnknownCategory(String),
    #[error("ban duration must be between 1 and {max} seconds, got {got}")]
    InvalidDuration { got: u64, max: u64 },
    #[error("limit must be between 1 and {max}, got {got}")]
    InvalidLimit { got: usize, max: usize },
    #[error("missing or invalid admin token")]
    Unauthorized,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ControlError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::UnknownCategory(_) => "UNKNOWN_CATEGORY",
            Self::InvalidDuration { .. } => "INVALID_DURATION",
            Self::InvalidLimit { .. } => "INVALID_LIMIT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Store(_) => "STORE_UNAVAILABLE",
        }
    }
}

impl ResponseError for ControlError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BanStatus {
    pub identifier: String,
    pub banned: bool,
    pub remaining_seconds: Option<u64>,
    pub ban: Option<BanRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed: u64,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DdosView {
    pub enabled: bool,
    pub threshold: u64,
    pub window_seconds: u64,
    pub ban_duration_seconds: u64,
    pub whitelist_entries: usize,
}

/// Effective policy configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigView {
    pub rate_limit_enabled: bool,
    pub default_category: String,
    pub categories: BTreeMap<String, PolicyCategory>,
    pub ddos: DdosView,
}

pub struct ControlPlane {
    controller: Arc<AdmissionController>,
    admin: AdminConfig,
    rate_limit_enabled: bool,
    ddos_enabled: bool,
    ddos_ban_seconds: u64,
}

impl ControlPlane {
    pub fn new(controller: Arc<AdmissionController>, config: &Config) -> Self {
        Self {
            controller,
            admin: config.admin.clone(),
            rate_limit_enabled: config.rate_limit.enabled,
            ddos_enabled: config.ddos.enabled,
            ddos_ban_seconds: config.ddos.ban_duration_seconds,
        }
    }

    pub fn admin(&self) -> &AdminConfig {
        &self.admin
    }

    /// Window counts per category, ban total and the busiest identities
    pub async fn stats(&self) -> Result<AdmissionStats, ControlError> {
        let now = now_ts();
        let windows = self.live_windows(now).await?;
        let total_banned_ips = self.controller.bans().count(now).await?;

        let mut endpoints = BTreeMap::new();
        for snapshot in &windows {
            *endpoints.entry(snapshot.key.category.clone()).or_insert(0) += 1;
        }

        Ok(AdmissionStats {
            total_rate_limited_keys: windows.len() as u64,
            total_banned_ips,
            endpoints,
            top_ips: summarise_offenders(&windows, STATS_TOP_IPS),
            degraded: self.controller.degraded_status(),
        })
    }

    /// Identities with the most in-window requests across all categories
    pub async fn top_offenders(&self, limit: usize) -> Result<Vec<OffenderSummary>, ControlError> {
        if limit == 0 || limit > self.admin.max_top_limit {
            return Err(ControlError::InvalidLimit {
                got: limit,
                max: self.admin.max_top_limit,
            });
        }
        let windows = self.live_windows(now_ts()).await?;
        Ok(summarise_offenders(&windows, limit))
    }

    pub async fn status(
        &self,
        identifier: &str,
        category: &str,
    ) -> Result<WindowStatus, ControlError> {
        let identity = canonical_identifier(identifier)?;
        let category = self.known_category(category)?;
        let status = self
            .controller
            .limiter()
            .status_at(category, &identity, now_ts())
            .await?;
        Ok(status)
    }

    /// Clear one window; true if it held anything
    pub async fn reset(&self, identifier: &str, category: &str) -> Result<bool, ControlError> {
        let identity = canonical_identifier(identifier)?;
        let category = self.known_category(category)?;
        let existed = self.controller.limiter().reset(category, &identity).await?;
        info!(
            "Reset rate limit window {} for {}",
            category,
            sanitize_for_logging(&identity)
        );
        Ok(existed)
    }

    pub async fn ban(
        &self,
        identifier: &str,
        duration_seconds: u64,
        reason: &str,
    ) -> Result<BanRecord, ControlError> {
        let identity = canonical_identifier(identifier)?;
        if duration_seconds == 0 || duration_seconds > self.admin.max_ban_seconds {
            return Err(ControlError::InvalidDuration {
                got: duration_seconds,
                max: self.admin.max_ban_seconds,
            });
        }

        let mut reason = sanitize_for_logging(reason.trim());
        if reason.is_empty() {
            reason = "manual".to_string();
        }
        if reason.chars().count() > MAX_REASON_LEN {
            reason = reason.chars().take(MAX_REASON_LEN).collect();
        }

        let record = self
            .controller
            .bans()
            .ban(&identity, duration_seconds, &reason, now_ts())
            .await?;
        Ok(record)
    }

    pub async fn unban(&self, identifier: &str) -> Result<bool, ControlError> {
        let identity = canonical_identifier(identifier)?;
        Ok(self.controller.bans().unban(&identity).await?)
    }

    pub async fn ban_status(&self, identifier: &str) -> Result<BanStatus, ControlError> {
        let identity = canonical_identifier(identifier)?;
        let now = now_ts();
        let ban = self.controller.bans().is_banned(&identity, now).await?;
        Ok(BanStatus {
            identifier: identity,
            banned: ban.is_some(),
            remaining_seconds: ban.as_ref().map(|record| record.remaining_seconds(now)),
            ban,
        })
    }

    /// Purge out-of-window entries and lapsed bans
    pub async fn cleanup(&self) -> Result<CleanupReport, ControlError> {
        let window_seconds = self
            .controller
            .limiter()
            .policies()
            .max_window_seconds()
            .max(self.controller.detector().window_seconds());
        let removed = self
            .controller
            .store()
            .purge_expired(window_seconds, now_ts())
            .await?;
        info!("Cleanup removed {} expired entries", removed);
        Ok(CleanupReport {
            removed,
            window_seconds,
        })
    }

    pub fn config_view(&self) -> ConfigView {
        let policies = self.controller.limiter().policies();
        let categories = policies
            .names()
            .map(|name| (name.to_string(), policies.resolve(name).clone()))
            .collect();
        ConfigView {
            rate_limit_enabled: self.rate_limit_enabled,
            default_category: policies.default_category().name.clone(),
            categories,
            ddos: DdosView {
                enabled: self.ddos_enabled,
                threshold: self.controller.detector().threshold(),
                window_seconds: self.controller.detector().window_seconds(),
                ban_duration_seconds: self.ddos_ban_seconds,
                whitelist_entries: self.controller.whitelist().len(),
            },
        }
    }

    async fn live_windows(&self, now: f64) -> Result<Vec<WindowSnapshot>, ControlError> {
        let policies = self.controller.limiter().policies();
        Ok(self.controller.store().active_windows(policies, now).await?)
    }

    fn known_category<'a>(&self, category: &'a str) -> Result<&'a str, ControlError> {
        if self.controller.limiter().policies().contains(category) {
            Ok(category)
        } else {
            Err(ControlError::UnknownCategory(sanitize_for_logging(category)))
        }
    }
}

/// IP literals are stored in canonical form; opaque ids are kept as given.
/// The shared bucket for unresolvable callers is never addressable.
fn canonical_identifier(identifier: &str) -> Result<String, ControlError> {
    if !is_valid_identifier(identifier)
        || identifier.eq_ignore_ascii_case(IdentityKey::UNKNOWN)
    {
        return Err(ControlError::InvalidIdentifier(sanitize_for_logging(
            identifier,
        )));
    }
    Ok(IdentityKey::parse(identifier)
        .map(|key| key.as_str().to_string())
        .unwrap_or_else(|| identifier.to_string()))
}

fn summarise_offenders(
    windows: &[WindowSnapshot],
    limit: usize,
) -> Vec<OffenderSummary> {
    let mut by_identity: HashMap<&str, OffenderSummary> = HashMap::new();
    for snapshot in windows {
        let summary = by_identity
            .entry(snapshot.key.identity.as_str())
            .or_insert_with(|| OffenderSummary {
                ip: snapshot.key.identity.clone(),
                total_requests: 0,
                endpoints: BTreeMap::new(),
            });
        summary.total_requests += snapshot.count;
        *summary
            .endpoints
            .entry(snapshot.key.category.clone())
            .or_insert(0) += snapshot.count;
    }

    let mut offenders: Vec<OffenderSummary> = by_identity.into_values().collect();
    offenders.sort_by(|a, b| {
        b.total_requests
            .cmp(&a.total_requests)
            .then_with(|| a.ip.cmp(&b.ip))
    });
    offenders.truncate(limit);
    offenders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::PolicyTable;
    use crate::store::{CounterStore, MemoryStore, MockCounterStore};

    fn plane_with(store: Arc<dyn CounterStore>) -> ControlPlane {
        let config = Config::default();
        let policies = PolicyTable::from_config(&config.rate_limit).unwrap();
        let controller = AdmissionController::new(&config, Arc::new(policies), store);
        ControlPlane::new(Arc::new(controller), &config)
    }

    fn plane() -> ControlPlane {
        plane_with(Arc::new(MemoryStore::new()))
    }

    async fn traffic(plane: &ControlPlane, identity: &str, category: &str, count: u32) {
        let limiter = plane.controller.limiter();
        let now = now_ts();
        for i in 0..count {
            limiter
                .check_and_record_at(category, identity, now + f64::from(i) * 0.01)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_stats_and_top_offenders() {
        let plane = plane();
        traffic(&plane, "10.0.0.1", "api_general", 7).await;
        traffic(&plane, "10.0.0.1", "auth_login", 3).await;
        traffic(&plane, "10.0.0.2", "api_general", 4).await;
        plane.ban("10.0.0.9", 60, "abuse").await.unwrap();

        let stats = plane.stats().await.unwrap();
        assert_eq!(stats.total_rate_limited_keys, 3);
        assert_eq!(stats.total_banned_ips, 1);
        assert_eq!(stats.endpoints.get("api_general"), Some(&2));
        assert_eq!(stats.endpoints.get("auth_login"), Some(&1));
        assert_eq!(stats.top_ips[0].ip, "10.0.0.1");
        assert_eq!(stats.top_ips[0].total_requests, 10);
        assert_eq!(stats.top_ips[0].endpoints.get("auth_login"), Some(&3));

        let top = plane.top_offenders(1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_stats_skip_windows_that_have_lapsed() {
        let plane = plane();
        let limiter = plane.controller.limiter();
        limiter
            .check_and_record_at("api_general", "10.0.0.5", now_ts() - 120.0)
            .await
            .unwrap();
        traffic(&plane, "10.0.0.6", "api_general", 2).await;

        let stats = plane.stats().await.unwrap();
        assert_eq!(stats.total_rate_limited_keys, 1);
        let top = plane.top_offenders(10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ip, "10.0.0.6");
    }

    #[tokio::test]
    async fn test_status_and_reset() {
        let plane = plane();
        traffic(&plane, "10.0.0.3", "auth_login", 2).await;

        let status = plane.status("10.0.0.3", "auth_login").await.unwrap();
        assert_eq!(status.current_requests, 2);
        assert_eq!(status.limit, 5);
        assert_eq!(status.remaining, 5);

        assert!(plane.reset("10.0.0.3", "auth_login").await.unwrap());
        let status = plane.status("10.0.0.3", "auth_login").await.unwrap();
        assert_eq!(status.current_requests, 0);
        assert!(!plane.reset("10.0.0.3", "auth_login").await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_input_rejected() {
        let plane = plane();
        assert!(matches!(
            plane.status("10.0.0.1; DROP", "auth_login").await,
            Err(ControlError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            plane.status(&"a".repeat(51), "auth_login").await,
            Err(ControlError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            plane.reset("10.0.0.1", "no_such_category").await,
            Err(ControlError::UnknownCategory(_))
        ));
        assert!(matches!(
            plane.ban("10.0.0.1", 0, "x").await,
            Err(ControlError::InvalidDuration { .. })
        ));
        assert!(matches!(
            plane.ban("10.0.0.1", 31 * 24 * 3600, "x").await,
            Err(ControlError::InvalidDuration { .. })
        ));
        assert!(matches!(
            plane.top_offenders(0).await,
            Err(ControlError::InvalidLimit { .. })
        ));
        assert_eq!(
            ControlError::UnknownCategory("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_validation_happens_before_store_access() {
        // A mock without expectations panics on any store call
        let plane = plane_with(Arc::new(MockCounterStore::new()));
        assert!(plane.ban("not valid!", 60, "x").await.is_err());
        assert!(plane.unban("").await.is_err());
        assert!(plane.status("10.0.0.1", "bogus").await.is_err());
    }

    #[tokio::test]
    async fn test_ban_lifecycle_with_canonical_identity() {
        let plane = plane();
        let record = plane
            .ban("2001:DB8::1", 600, "scraping\n\tloop")
            .await
            .unwrap();
        assert_eq!(record.identity, "2001:db8::1");
        assert_eq!(record.reason, "scrapingloop");

        let status = plane.ban_status("2001:db8::1").await.unwrap();
        assert!(status.banned);
        assert!(status.remaining_seconds.unwrap() <= 600);

        assert!(plane.unban("2001:db8::1").await.unwrap());
        assert!(!plane.ban_status("2001:db8::1").await.unwrap().banned);
    }

    #[tokio::test]
    async fn test_multibyte_reason_is_cut_on_char_boundary() {
        let plane = plane();
        let record = plane.ban("10.0.0.7", 60, &"€".repeat(300)).await.unwrap();
        assert_eq!(record.reason.chars().count(), MAX_REASON_LEN);
        assert!(record.reason.chars().all(|c| c == '€' || c == '.'));

        let record = plane.ban("10.0.0.8", 60, &"é".repeat(150)).await.unwrap();
        assert_eq!(record.reason, "é".repeat(150));
    }

    #[tokio::test]
    async fn test_unknown_bucket_cannot_be_banned() {
        let plane = plane_with(Arc::new(MockCounterStore::new()));
        for identifier in ["unknown", "UNKNOWN"] {
            assert!(matches!(
                plane.ban(identifier, 60, "x").await,
                Err(ControlError::InvalidIdentifier(_))
            ));
        }
        assert!(matches!(
            plane.reset("unknown", "api_general").await,
            Err(ControlError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_store_errors_map_to_service_unavailable() {
        let mut store = MockCounterStore::new();
        store
            .expect_active_windows()
            .returning(|_, _| Err(StoreError::Unavailable("down".to_string())));
        let plane = plane_with(Arc::new(store));

        let err = plane.stats().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cleanup_and_config_view() {
        let plane = plane();
        traffic(&plane, "10.0.0.4", "api_general", 2).await;
        let report = plane.cleanup().await.unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.window_seconds, 300);

        let view = plane.config_view();
        assert_eq!(view.default_category, "api_general");
        assert_eq!(view.categories.len(), 6);
        assert_eq!(view.categories["websocket"].max_requests, 2);
        assert_eq!(view.ddos.threshold, 300);
        assert_eq!(view.ddos.whitelist_entries, 2);
    }
}
