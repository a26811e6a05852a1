use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rate limit policy for one endpoint category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCategory {
    /// Category name, filled in from the configuration key
    #[serde(skip)]
    pub name: String,
    /// Requests admitted per window before burst is consumed
    pub max_requests: u32,
    /// Sliding window length in seconds
    pub window_seconds: u64,
    /// Extra requests allowed above `max_requests` per window
    #[serde(default)]
    pub burst_allowance: u32,
}

impl PolicyCategory {
    pub fn new(name: &str, max_requests: u32, window_seconds: u64, burst_allowance: u32) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            window_seconds,
            burst_allowance,
        }
    }
}

/// How a route pattern is matched against the request path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    #[default]
    Contains,
    Prefix,
    Exact,
}

/// Classifier rule mapping a path pattern to a category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub category: String,
    #[serde(default)]
    pub match_kind: MatchKind,
    /// Restrict the rule to these methods; empty matches any method
    #[serde(default)]
    pub methods: Vec<String>,
}

impl RouteRule {
    fn new(pattern: &str, category: &str, match_kind: MatchKind) -> Self {
        Self {
            pattern: pattern.to_string(),
            category: category.to_string(),
            match_kind,
            methods: Vec::new(),
        }
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether per-category rate limiting is enabled
    pub enabled: bool,
    /// Category used when no route matches or a name is unknown
    pub default_category: String,
    /// Paths that skip the admission pipeline entirely
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,
    /// Policy table keyed by category name
    #[serde(default = "default_categories")]
    pub categories: HashMap<String, PolicyCategory>,
    /// Ordered classifier rules, first match wins
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,
}

/// DDoS detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    pub enabled: bool,
    /// Requests per identity within `window_seconds` that trigger a ban
    pub threshold: u64,
    pub window_seconds: u64,
    pub ban_duration_seconds: u64,
    /// IP literals or CIDR ranges that bypass every check
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,
}

/// Caller identity resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Peers whose forwarding headers are honoured: `*`, IPs or CIDRs
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,
    pub forwarded_header: String,
    pub real_ip_header: String,
}

/// Which counter store backs the admission layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// How often the memory backend purges lapsed entries
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Upper bound for a single store round trip
    pub timeout_ms: u64,
    /// Upper bound for key scans issued by operator calls
    pub scan_timeout_ms: u64,
    /// Minimum delay between reconnect attempts after a failed connect
    pub reconnect_backoff_ms: u64,
    pub key_prefix: String,
    /// Run check-and-record as one server-side script
    pub atomic_window: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Operator API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Shared bearer token; when unset the routes rely on upstream auth
    #[serde(default)]
    pub token: Option<String>,
    pub max_ban_seconds: u64,
    pub max_top_limit: usize,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub redis: RedisConfig,
    pub identity: IdentityConfig,
    pub rate_limit: RateLimitConfig,
    pub ddos: DdosConfig,
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            store: StoreConfig {
                backend: StoreBackend::Redis,
                sweep_interval_seconds: default_sweep_interval_seconds(),
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                timeout_ms: 250,
                scan_timeout_ms: 2_000,
                reconnect_backoff_ms: 1_000,
                key_prefix: "admission:".to_string(),
                atomic_window: true,
            },
            identity: IdentityConfig {
                trusted_proxies: default_trusted_proxies(),
                forwarded_header: "x-forwarded-for".to_string(),
                real_ip_header: "x-real-ip".to_string(),
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                default_category: "api_general".to_string(),
                bypass_paths: default_bypass_paths(),
                categories: default_categories(),
                routes: default_routes(),
            },
            ddos: DdosConfig {
                enabled: true,
                threshold: 300,
                window_seconds: 60,
                ban_duration_seconds: 3_600,
                whitelist: default_whitelist(),
            },
            admin: AdminConfig {
                enabled: true,
                token: None,
                max_ban_seconds: 30 * 24 * 3_600,
                max_top_limit: 100,
            },
        }
    }
}

/// Forwarding headers are ignored until a proxy is configured
pub fn default_trusted_proxies() -> Vec<String> {
    Vec::new()
}

pub fn default_sweep_interval_seconds() -> u64 {
    60
}

pub fn default_whitelist() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

pub fn default_bypass_paths() -> Vec<String> {
    [
        "/health",
        "/healthz",
        "/ready",
        "/metrics",
        "/favicon.ico",
        "/api/v1/admission/check",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

pub fn default_categories() -> HashMap<String, PolicyCategory> {
    [
        PolicyCategory::new("auth_login", 5, 60, 2),
        PolicyCategory::new("auth_register", 3, 300, 1),
        PolicyCategory::new("vpn_connect", 10, 60, 5),
        PolicyCategory::new("payments", 10, 60, 2),
        PolicyCategory::new("websocket", 2, 60, 1),
        PolicyCategory::new("api_general", 100, 60, 20),
    ]
    .into_iter()
    .map(|p| (p.name.clone(), p))
    .collect()
}

pub fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/auth/login", "auth_login", MatchKind::Contains),
        RouteRule::new("/auth/signup", "auth_register", MatchKind::Contains),
        RouteRule::new("/auth/register", "auth_register", MatchKind::Contains),
        RouteRule::new("/vpn/connect", "vpn_connect", MatchKind::Contains),
        RouteRule::new("/payments", "payments", MatchKind::Contains),
        RouteRule::new("/ws", "websocket", MatchKind::Prefix),
    ]
}

/// Active ban for an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub identity: String,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
    pub duration_seconds: u64,
}

impl BanRecord {
    /// Unix timestamp (fractional seconds) at which the ban lapses
    pub fn expires_at(&self) -> f64 {
        self.banned_at.timestamp_millis() as f64 / 1000.0 + self.duration_seconds as f64
    }

    /// Whole seconds left on the ban at `now`, at least 1 while active
    pub fn remaining_seconds(&self, now: f64) -> u64 {
        let left = (self.expires_at() - now).ceil();
        if left < 1.0 {
            1
        } else {
            left as u64
        }
    }

    pub fn is_active(&self, now: f64) -> bool {
        self.expires_at() > now
    }
}

/// Current usage of one `(category, identity)` window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub endpoint: String,
    pub limit: u32,
    pub burst: u32,
    pub window: u64,
    pub current_requests: u64,
    pub burst_used: u64,
    pub remaining: u64,
    pub reset_time: i64,
}

/// Request totals for one identity across categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffenderSummary {
    pub ip: String,
    pub total_requests: u64,
    pub endpoints: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradedStatus {
    pub rate_limit: bool,
    pub ddos: bool,
}

/// Aggregate admission statistics for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub total_rate_limited_keys: u64,
    pub total_banned_ips: u64,
    pub endpoints: BTreeMap<String, u64>,
    pub top_ips: Vec<OffenderSummary>,
    pub degraded: DegradedStatus,
}
