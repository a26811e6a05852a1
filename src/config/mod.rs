//! Configuration management for the admission layer.
//!
//! Configuration is layered: built-in defaults, then the TOML file named by
//! `CONFIG_FILE`, then `ADMISSION_*` environment variables with `__`
//! separating sections (`ADMISSION_REDIS__URL`).

use std::env;
use std::net::IpAddr;

use ::config::{Config as ConfigBuilder, ConfigError, Environment, File};
use ipnet::IpNet;

use crate::core::classifier::PolicyTable;
use crate::models::Config;

const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

/// Load configuration from the file named by `CONFIG_FILE` and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    dotenv::dotenv().ok();
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_config_from(&config_file)
}

/// Load and validate configuration using `config_file` as the file layer.
/// A missing file is not an error.
pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let defaults = Config::default();

    let config = ConfigBuilder::builder()
        .set_default("server.host", defaults.server.host)?
        .set_default("server.port", i64::from(defaults.server.port))?
        .set_default("store.backend", "redis")?
        .set_default("store.sweep_interval_seconds", defaults.store.sweep_interval_seconds)?
        .set_default("redis.url", defaults.redis.url)?
        .set_default("redis.timeout_ms", defaults.redis.timeout_ms)?
        .set_default("redis.scan_timeout_ms", defaults.redis.scan_timeout_ms)?
        .set_default("redis.reconnect_backoff_ms", defaults.redis.reconnect_backoff_ms)?
        .set_default("redis.key_prefix", defaults.redis.key_prefix)?
        .set_default("redis.atomic_window", defaults.redis.atomic_window)?
        .set_default("identity.forwarded_header", defaults.identity.forwarded_header)?
        .set_default("identity.real_ip_header", defaults.identity.real_ip_header)?
        .set_default("rate_limit.enabled", defaults.rate_limit.enabled)?
        .set_default("rate_limit.default_category", defaults.rate_limit.default_category)?
        .set_default("ddos.enabled", defaults.ddos.enabled)?
        .set_default("ddos.threshold", defaults.ddos.threshold)?
        .set_default("ddos.window_seconds", defaults.ddos.window_seconds)?
        .set_default("ddos.ban_duration_seconds", defaults.ddos.ban_duration_seconds)?
        .set_default("admin.enabled", defaults.admin.enabled)?
        .set_default("admin.max_ban_seconds", defaults.admin.max_ban_seconds)?
        .set_default("admin.max_top_limit", defaults.admin.max_top_limit as u64)?
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("ADMISSION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Reject configurations the admission pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate_limit = &self.rate_limit;
        if rate_limit.categories.is_empty() {
            return invalid("rate_limit.categories must not be empty".to_string());
        }
        for (name, policy) in &rate_limit.categories {
            if policy.max_requests == 0 || policy.window_seconds == 0 {
                return invalid(format!(
                    "category {} needs max_requests > 0 and window_seconds > 0",
                    name
                ));
            }
        }
        if !rate_limit.categories.contains_key(&rate_limit.default_category) {
            return invalid(format!(
                "default category {} is not defined",
                rate_limit.default_category
            ));
        }
        if let Some(route) = rate_limit
            .routes
            .iter()
            .find(|route| !rate_limit.categories.contains_key(&route.category))
        {
            return invalid(format!(
                "route {} targets unknown category {}",
                route.pattern, route.category
            ));
        }

        let ddos = &self.ddos;
        if ddos.threshold == 0 || ddos.window_seconds == 0 || ddos.ban_duration_seconds == 0 {
            return invalid(
                "ddos threshold, window_seconds and ban_duration_seconds must be positive"
                    .to_string(),
            );
        }
        if let Some(entry) = ddos.whitelist.iter().find(|entry| !is_network(entry)) {
            return invalid(format!("invalid whitelist entry: {}", entry));
        }
        if let Some(entry) = self
            .identity
            .trusted_proxies
            .iter()
            .find(|entry| entry.trim() != "*" && !is_network(entry))
        {
            return invalid(format!("invalid trusted proxy entry: {}", entry));
        }

        if self.store.sweep_interval_seconds == 0 {
            return invalid("store sweep_interval_seconds must be positive".to_string());
        }
        if self.admin.max_ban_seconds == 0 || self.admin.max_top_limit == 0 {
            return invalid("admin limits must be positive".to_string());
        }
        Ok(())
    }
}

/// Policy table for a validated configuration
pub fn build_policy_table(config: &Config) -> Result<PolicyTable, ConfigError> {
    PolicyTable::from_config(&config.rate_limit).ok_or_else(|| {
        ConfigError::Message(format!(
            "default category {} is not defined",
            config.rate_limit.default_category
        ))
    })
}

fn is_network(entry: &str) -> bool {
    let entry = entry.trim();
    entry.parse::<IpNet>().is_ok() || entry.parse::<IpAddr>().is_ok()
}

fn invalid(message: String) -> Result<(), ConfigError> {
    Err(ConfigError::Message(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicyCategory, RouteRule, StoreBackend};
    use std::io::Write;

    fn write_config(contents: &str) -> std::path::PathBuf {
        let path = env::temp_dir().join(format!("admission-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
        let table = build_policy_table(&Config::default()).unwrap();
        assert_eq!(table.default_category().max_requests, 100);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config_from("/nonexistent/admission.toml").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.rate_limit.categories.len(), 6);
        assert_eq!(config.ddos.whitelist, vec!["127.0.0.1", "::1"]);
        assert!(config.redis.atomic_window);
        assert!(config.identity.trusted_proxies.is_empty());
        assert_eq!(config.store.sweep_interval_seconds, 60);
    }

    #[test]
    fn test_file_overrides() {
        let path = write_config(
            r#"
[store]
backend = "memory"

[ddos]
threshold = 50
whitelist = ["10.0.0.0/8"]

[rate_limit]
default_category = "general"

[rate_limit.categories.general]
max_requests = 20
window_seconds = 10

[[rate_limit.routes]]
pattern = "/login"
category = "general"
match_kind = "exact"
methods = ["POST"]
"#,
        );
        let config = load_config_from(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.ddos.threshold, 50);
        assert_eq!(config.ddos.window_seconds, 60);
        assert_eq!(config.ddos.whitelist, vec!["10.0.0.0/8"]);
        assert_eq!(config.rate_limit.categories.len(), 1);
        assert_eq!(config.rate_limit.categories["general"].burst_allowance, 0);
        assert_eq!(config.rate_limit.routes.len(), 1);
        assert_eq!(config.rate_limit.routes[0].methods, vec!["POST"]);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let path = write_config(
            r#"
[rate_limit.categories.api_general]
max_requests = 0
window_seconds = 60
"#,
        );
        let result = load_config_from(path.to_str().unwrap());
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.rate_limit.default_category = "missing".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.routes.push(RouteRule {
            pattern: "/x".to_string(),
            category: "nope".to_string(),
            match_kind: Default::default(),
            methods: Vec::new(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .rate_limit
            .categories
            .insert("zero".to_string(), PolicyCategory::new("zero", 5, 0, 0));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ddos.threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ddos.whitelist.push("not-an-ip".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identity.trusted_proxies = vec!["10.0.0.0/8".to_string(), "bogus".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.sweep_interval_seconds = 0;
        assert!(config.validate().is_err());
    }
}
