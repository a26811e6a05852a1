//! Endpoint classification and the typed policy table.

use std::collections::HashMap;

use crate::models::{MatchKind, PolicyCategory, RateLimitConfig, RouteRule};

/// Policy table validated at startup.
///
/// Lookups never fail: unknown names resolve to the default category.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    categories: HashMap<String, PolicyCategory>,
    default_category: PolicyCategory,
}

impl PolicyTable {
    /// Build the table; `None` when the default category is missing
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        let categories: HashMap<String, PolicyCategory> = config
            .categories
            .iter()
            .map(|(name, policy)| {
                let mut policy = policy.clone();
                policy.name = name.clone();
                (name.clone(), policy)
            })
            .collect();
        let default_category = categories.get(&config.default_category)?.clone();
        Some(Self {
            categories,
            default_category,
        })
    }

    pub fn resolve(&self, name: &str) -> &PolicyCategory {
        self.categories.get(name).unwrap_or(&self.default_category)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.categories.contains_key(name)
    }

    pub fn default_category(&self) -> &PolicyCategory {
        &self.default_category
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    /// Longest window among all categories
    pub fn max_window_seconds(&self) -> u64 {
        self.categories
            .values()
            .map(|p| p.window_seconds)
            .max()
            .unwrap_or(self.default_category.window_seconds)
    }
}

/// Maps a request path and method to a policy category name
#[derive(Debug, Clone)]
pub struct EndpointClassifier {
    routes: Vec<RouteRule>,
    default_category: String,
    bypass_paths: Vec<String>,
}

impl EndpointClassifier {
    pub fn new(routes: Vec<RouteRule>, default_category: &str) -> Self {
        Self {
            routes,
            default_category: default_category.to_string(),
            bypass_paths: Vec::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            bypass_paths: config.bypass_paths.clone(),
            ..Self::new(config.routes.clone(), &config.default_category)
        }
    }

    /// Health and metrics paths that skip admission entirely
    pub fn is_bypass(&self, path: &str) -> bool {
        self.bypass_paths.iter().any(|p| p == path)
    }

    /// First matching rule wins; no match yields the default category
    pub fn classify(&self, path: &str, method: &str) -> &str {
        self.routes
            .iter()
            .find(|rule| Self::matches(rule, path, method))
            .map(|rule| rule.category.as_str())
            .unwrap_or(&self.default_category)
    }

    fn matches(rule: &RouteRule, path: &str, method: &str) -> bool {
        let method_ok = rule.methods.is_empty()
            || rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        let path_ok = match rule.match_kind {
            MatchKind::Contains => path.contains(&rule.pattern),
            MatchKind::Prefix => path.starts_with(&rule.pattern),
            MatchKind::Exact => path == rule.pattern,
        };
        method_ok && path_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;

    fn classifier() -> EndpointClassifier {
        EndpointClassifier::from_config(&Config::default().rate_limit)
    }

    #[test]
    fn test_bypass_paths_are_exact() {
        let classifier = classifier();
        assert!(classifier.is_bypass("/health"));
        assert!(classifier.is_bypass("/metrics"));
        assert!(!classifier.is_bypass("/health/deep"));
        assert!(!classifier.is_bypass("/api/v1/servers"));
    }

    #[test]
    fn test_default_routes() {
        let classifier = classifier();
        assert_eq!(classifier.classify("/api/v1/auth/login", "POST"), "auth_login");
        assert_eq!(classifier.classify("/api/v1/auth/signup", "POST"), "auth_register");
        assert_eq!(classifier.classify("/api/v1/vpn/connect", "POST"), "vpn_connect");
        assert_eq!(classifier.classify("/api/v1/payments/intent", "GET"), "payments");
        assert_eq!(classifier.classify("/ws/stream", "GET"), "websocket");
        assert_eq!(classifier.classify("/api/v1/servers", "GET"), "api_general");
    }

    #[test]
    fn test_prefix_rules_do_not_match_mid_path() {
        assert_eq!(classifier().classify("/api/ws", "GET"), "api_general");
    }

    #[test]
    fn test_first_match_wins_and_methods_filter() {
        let mut login_post = RouteRule {
            pattern: "/auth".to_string(),
            category: "auth_login".to_string(),
            match_kind: MatchKind::Prefix,
            methods: vec!["post".to_string()],
        };
        let any_auth = RouteRule {
            pattern: "/auth".to_string(),
            category: "payments".to_string(),
            match_kind: MatchKind::Prefix,
            methods: Vec::new(),
        };
        let classifier =
            EndpointClassifier::new(vec![login_post.clone(), any_auth.clone()], "api_general");
        assert_eq!(classifier.classify("/auth/x", "POST"), "auth_login");
        assert_eq!(classifier.classify("/auth/x", "GET"), "payments");

        login_post.match_kind = MatchKind::Exact;
        let classifier = EndpointClassifier::new(vec![login_post, any_auth], "api_general");
        assert_eq!(classifier.classify("/auth/x", "POST"), "payments");
        assert_eq!(classifier.classify("/auth", "POST"), "auth_login");
    }

    #[test]
    fn test_policy_table_falls_back_to_default() {
        let table = PolicyTable::from_config(&Config::default().rate_limit).unwrap();
        assert_eq!(table.resolve("auth_login").max_requests, 5);
        assert_eq!(table.resolve("auth_login").name, "auth_login");
        assert_eq!(table.resolve("no_such_category").name, "api_general");
        assert!(!table.contains("no_such_category"));
        assert_eq!(table.max_window_seconds(), 300);
    }

    #[test]
    fn test_policy_table_requires_default() {
        let mut config = Config::default().rate_limit;
        config.default_category = "missing".to_string();
        assert!(PolicyTable::from_config(&config).is_none());
    }
}
