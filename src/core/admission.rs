//! Per-request admission pipeline.
//!
//! Order of checks: whitelist, ban registry, flood detector, per-category
//! window. Each request ends in exactly one [`Verdict`]. Store failures are
//! absorbed by the matching [`DegradedMode`] and the request is admitted.

use std::net::IpAddr;
use std::sync::Arc;

use actix_web::http::header::HeaderMap;
use log::warn;
use metrics::counter;
use serde::Serialize;

use crate::core::ban_registry::{BanRegistry, DDOS_BAN_REASON};
use crate::core::classifier::{EndpointClassifier, PolicyTable};
use crate::core::ddos_detector::DdosDetector;
use crate::core::degraded::DegradedMode;
use crate::core::identity::{IdentityKey, IdentityResolver, Whitelist};
use crate::core::rate_limiter::RateLimiter;
use crate::models::{Config, DegradedStatus};
use crate::store::CounterStore;
use crate::utils::{now_ts, sanitize_for_logging};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    RateLimitExceeded,
    DdosDetected,
    IpBanned,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::DdosDetected => "DDOS_DETECTED",
            Self::IpBanned => "IP_BANNED",
        }
    }
}

/// Rate limit details attached to a window denial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitDetails {
    pub limit: u32,
    /// Unix time at which a retry will be admitted
    pub reset_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,
    pub message: String,
    pub retry_after: u64,
    pub limit: Option<LimitDetails>,
}

impl Denial {
    fn banned(retry_after: u64) -> Self {
        Self {
            reason: DenialReason::IpBanned,
            message: "Your IP has been temporarily banned due to suspicious activity".to_string(),
            retry_after,
            limit: None,
        }
    }

    fn flood(retry_after: u64) -> Self {
        Self {
            reason: DenialReason::DdosDetected,
            message: "DDoS activity detected. IP banned temporarily".to_string(),
            retry_after,
            limit: None,
        }
    }

    fn rate_limited(category: &str, retry_after: u64, limit: u32, now: f64) -> Self {
        Self {
            reason: DenialReason::RateLimitExceeded,
            message: format!("Rate limit exceeded for {}", category),
            retry_after,
            limit: Some(LimitDetails {
                limit,
                reset_at: now.ceil() as i64 + retry_after as i64,
            }),
        }
    }
}

/// Headers advertised on admitted responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit(Option<RateLimitHeaders>),
    Deny(Denial),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit(_))
    }
}

/// Composes identity, classification, bans, flood detection and windows
pub struct AdmissionController {
    resolver: IdentityResolver,
    classifier: EndpointClassifier,
    whitelist: Whitelist,
    limiter: RateLimiter,
    detector: DdosDetector,
    bans: BanRegistry,
    store: Arc<dyn CounterStore>,
    rate_limit_enabled: bool,
    ddos_enabled: bool,
    ddos_ban_seconds: u64,
    rate_limit_health: DegradedMode,
    ddos_health: DegradedMode,
}

impl AdmissionController {
    pub fn new(config: &Config, policies: Arc<PolicyTable>, store: Arc<dyn CounterStore>) -> Self {
        Self {
            resolver: IdentityResolver::new(&config.identity),
            classifier: EndpointClassifier::from_config(&config.rate_limit),
            whitelist: Whitelist::new(&config.ddos.whitelist),
            limiter: RateLimiter::new(store.clone(), policies),
            detector: DdosDetector::new(store.clone(), &config.ddos),
            bans: BanRegistry::new(store.clone()),
            store,
            rate_limit_enabled: config.rate_limit.enabled,
            ddos_enabled: config.ddos.enabled,
            ddos_ban_seconds: config.ddos.ban_duration_seconds,
            rate_limit_health: DegradedMode::new("rate_limit"),
            ddos_health: DegradedMode::new("ddos"),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn bans(&self) -> &BanRegistry {
        &self.bans
    }

    pub fn detector(&self) -> &DdosDetector {
        &self.detector
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn is_bypass(&self, path: &str) -> bool {
        self.classifier.is_bypass(path)
    }

    pub fn resolve_identity(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> IdentityKey {
        self.resolver.resolve(headers, peer)
    }

    pub fn trusts_peer(&self, peer: Option<IpAddr>) -> bool {
        self.resolver.trusts_peer(peer)
    }

    pub fn resolve_literal(&self, candidate: Option<&str>) -> IdentityKey {
        self.resolver.resolve_literal(candidate)
    }

    pub fn degraded_status(&self) -> DegradedStatus {
        DegradedStatus {
            rate_limit: self.rate_limit_health.is_degraded(),
            ddos: self.ddos_health.is_degraded(),
        }
    }

    /// Decide whether a request may proceed
    pub async fn admit(&self, path: &str, method: &str, identity: &IdentityKey) -> Verdict {
        self.admit_at(path, method, identity, now_ts()).await
    }

    pub async fn admit_at(
        &self,
        path: &str,
        method: &str,
        identity: &IdentityKey,
        now: f64,
    ) -> Verdict {
        let verdict = self.decide(path, method, identity, now).await;
        match &verdict {
            Verdict::Admit(_) => {
                counter!("admission_decisions_total", 1, "outcome" => "admit", "reason" => "none");
            }
            Verdict::Deny(denial) => {
                counter!(
                    "admission_decisions_total",
                    1,
                    "outcome" => "deny",
                    "reason" => denial.reason.code()
                );
                warn!(
                    "Denied {} {} from {}: {}",
                    method,
                    sanitize_for_logging(path),
                    identity,
                    denial.reason.code()
                );
            }
        }
        verdict
    }

    async fn decide(&self, path: &str, method: &str, identity: &IdentityKey, now: f64) -> Verdict {
        if self.whitelist.contains(identity) {
            return Verdict::Admit(None);
        }
        if !self.rate_limit_enabled && !self.ddos_enabled {
            return Verdict::Admit(None);
        }

        // The shared unknown bucket is never banned
        if !identity.is_unknown() {
            if let Some(denial) = self.screen_identity(identity, now).await {
                return Verdict::Deny(denial);
            }
        }

        if !self.rate_limit_enabled {
            return Verdict::Admit(None);
        }

        let category = self.classifier.classify(path, method);
        let checked = self
            .limiter
            .check_and_record_at(category, identity.as_str(), now)
            .await;
        let Some(result) = self.rate_limit_health.guard(checked.map(Some), None) else {
            return Verdict::Admit(None);
        };

        if result.denied {
            return Verdict::Deny(Denial::rate_limited(
                category,
                result.retry_after,
                result.limit,
                now,
            ));
        }
        Verdict::Admit(Some(RateLimitHeaders {
            limit: result.limit,
            remaining: result.remaining,
        }))
    }

    /// Ban check, then flood detection
    async fn screen_identity(&self, identity: &IdentityKey, now: f64) -> Option<Denial> {
        let banned = self.bans.is_banned(identity.as_str(), now).await;
        if let Some(record) = self.ddos_health.guard(banned, None) {
            return Some(Denial::banned(record.remaining_seconds(now)));
        }

        if !self.ddos_enabled {
            return None;
        }

        let flooding = self
            .detector
            .record_and_evaluate_at(identity.as_str(), now)
            .await;
        if !self.ddos_health.guard(flooding, false) {
            return None;
        }

        if let Err(err) = self
            .bans
            .ban(identity.as_str(), self.ddos_ban_seconds, DDOS_BAN_REASON, now)
            .await
        {
            self.ddos_health.record_failure(&err);
        }
        Some(Denial::flood(self.ddos_ban_seconds))
    }
}
