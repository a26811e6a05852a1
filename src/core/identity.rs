//! Caller identity resolution.
//!
//! The identity is the caller's IP address in canonical text form, taken from
//! the forwarding headers when the direct peer is a trusted proxy and from the
//! peer address otherwise. Nothing here ever fails: an unresolvable caller
//! lands in the shared `"unknown"` bucket.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use actix_web::http::header::HeaderMap;
use ipnet::IpNet;
use log::warn;

use crate::models::IdentityConfig;

/// Validated caller identity used as a counting key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Shared bucket for callers with no usable address
    pub const UNKNOWN: &'static str = "unknown";

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// IPv4-mapped IPv6 addresses collapse to their IPv4 form
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }

    /// Parse an IP literal, optionally carrying a port (`ip:port`, `[v6]:port`)
    pub fn parse(candidate: &str) -> Option<Self> {
        let candidate = candidate.trim();
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            return Some(Self::from_ip(ip));
        }
        candidate
            .parse::<SocketAddr>()
            .ok()
            .map(|addr| Self::from_ip(addr.ip()))
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse IP literals and CIDR ranges; single addresses become host routes
pub fn parse_networks(entries: &[String], what: &str) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            if let Ok(net) = entry.parse::<IpNet>() {
                return Some(net);
            }
            match entry.parse::<IpAddr>() {
                Ok(ip) => Some(IpNet::from(ip)),
                Err(_) => {
                    warn!("Ignoring invalid {} entry: {}", what, entry);
                    None
                }
            }
        })
        .collect()
}

/// Which direct peers may set forwarding headers
#[derive(Debug, Clone)]
enum TrustedProxies {
    None,
    All,
    List(Vec<IpNet>),
}

impl TrustedProxies {
    fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            Self::None
        } else if proxies.iter().any(|p| p.trim() == "*") {
            Self::All
        } else {
            Self::List(parse_networks(proxies, "trusted proxy"))
        }
    }

    fn trusts(&self, peer: Option<IpAddr>) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(nets) => peer.is_some_and(|ip| nets.iter().any(|net| net.contains(&ip))),
        }
    }
}

/// Resolves the caller identity from request metadata
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    trusted: TrustedProxies,
    forwarded_header: String,
    real_ip_header: String,
}

impl IdentityResolver {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            trusted: TrustedProxies::from_config(&config.trusted_proxies),
            forwarded_header: config.forwarded_header.to_ascii_lowercase(),
            real_ip_header: config.real_ip_header.to_ascii_lowercase(),
        }
    }

    /// Forwarded-for first entry, then real-ip, then the peer address
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> IdentityKey {
        if self.trusted.trusts(peer) {
            let forwarded = self
                .header(headers, &self.forwarded_header)
                .and_then(|value| value.split(',').next())
                .and_then(IdentityKey::parse);
            if let Some(identity) = forwarded {
                return identity;
            }

            let real_ip = self
                .header(headers, &self.real_ip_header)
                .and_then(IdentityKey::parse);
            if let Some(identity) = real_ip {
                return identity;
            }
        }

        peer.map(IdentityKey::from_ip)
            .unwrap_or_else(IdentityKey::unknown)
    }

    /// Whether `peer` may speak for other callers
    pub fn trusts_peer(&self, peer: Option<IpAddr>) -> bool {
        self.trusted.trusts(peer)
    }

    /// Resolve an identity supplied as text, e.g. by a proxy calling the check endpoint
    pub fn resolve_literal(&self, candidate: Option<&str>) -> IdentityKey {
        candidate
            .and_then(IdentityKey::parse)
            .unwrap_or_else(IdentityKey::unknown)
    }

    fn header<'a>(&self, headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Static set of addresses exempt from every admission check
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    networks: Vec<IpNet>,
}

impl Whitelist {
    pub fn new(entries: &[String]) -> Self {
        Self {
            networks: parse_networks(entries, "whitelist"),
        }
    }

    pub fn contains(&self, identity: &IdentityKey) -> bool {
        identity
            .ip()
            .is_some_and(|ip| self.networks.iter().any(|net| net.contains(&ip)))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName, HeaderValue};

    fn config(trusted: &[&str]) -> IdentityConfig {
        IdentityConfig {
            trusted_proxies: trusted.iter().map(|s| s.to_string()).collect(),
            forwarded_header: "X-Forwarded-For".to_string(),
            real_ip_header: "X-Real-IP".to_string(),
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    fn peer() -> Option<IpAddr> {
        Some("10.0.0.10".parse().unwrap())
    }

    #[test]
    fn test_prefers_first_forwarded_entry() {
        let resolver = IdentityResolver::new(&config(&["*"]));
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.5, 10.0.0.1"),
            ("x-real-ip", "198.51.100.9"),
        ]);
        assert_eq!(resolver.resolve(&map, peer()).as_str(), "203.0.113.5");
    }

    #[test]
    fn test_skips_malformed_candidates() {
        let resolver = IdentityResolver::new(&config(&["*"]));
        let map = headers(&[
            ("x-forwarded-for", "not-an-ip"),
            ("x-real-ip", "198.51.100.9"),
        ]);
        assert_eq!(resolver.resolve(&map, peer()).as_str(), "198.51.100.9");

        let map = headers(&[("x-forwarded-for", "garbage"), ("x-real-ip", "999.1.1.1")]);
        assert_eq!(resolver.resolve(&map, peer()).as_str(), "10.0.0.10");
    }

    #[test]
    fn test_unresolvable_is_unknown() {
        let resolver = IdentityResolver::new(&config(&["*"]));
        let identity = resolver.resolve(&headers(&[("x-forwarded-for", "bogus")]), None);
        assert!(identity.is_unknown());
        assert_eq!(identity.to_string(), "unknown");
    }

    #[test]
    fn test_headers_ignored_from_untrusted_peer() {
        let map = headers(&[("x-forwarded-for", "203.0.113.5")]);

        let none = IdentityResolver::new(&config(&[]));
        assert_eq!(none.resolve(&map, peer()).as_str(), "10.0.0.10");

        let listed = IdentityResolver::new(&config(&["192.168.0.0/16"]));
        assert_eq!(listed.resolve(&map, peer()).as_str(), "10.0.0.10");

        let trusted = IdentityResolver::new(&config(&["10.0.0.0/8"]));
        assert_eq!(trusted.resolve(&map, peer()).as_str(), "203.0.113.5");
    }

    #[test]
    fn test_canonicalises_ports_and_ipv6() {
        assert_eq!(
            IdentityKey::parse("203.0.113.5:443").unwrap().as_str(),
            "203.0.113.5"
        );
        assert_eq!(
            IdentityKey::parse("[2001:0db8:0000::1]:8080").unwrap().as_str(),
            "2001:db8::1"
        );
        assert!(IdentityKey::parse("").is_none());
    }

    #[test]
    fn test_ipv4_mapped_addresses_collapse_to_ipv4() {
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert_eq!(IdentityKey::from_ip(mapped).as_str(), "127.0.0.1");
        assert_eq!(
            IdentityKey::parse("[::ffff:203.0.113.7]:443").unwrap().as_str(),
            "203.0.113.7"
        );

        // A dual-stack listener reports v4 peers in mapped form
        let resolver = IdentityResolver::new(&config(&[]));
        let identity = resolver.resolve(&HeaderMap::new(), Some(mapped));
        let whitelist = Whitelist::new(&["127.0.0.1".to_string()]);
        assert!(whitelist.contains(&identity));
    }

    #[test]
    fn test_trusts_peer_follows_proxy_list() {
        assert!(!IdentityResolver::new(&config(&[])).trusts_peer(peer()));
        assert!(IdentityResolver::new(&config(&["10.0.0.0/8"])).trusts_peer(peer()));
        assert!(!IdentityResolver::new(&config(&["10.0.0.0/8"])).trusts_peer(None));
    }

    #[test]
    fn test_whitelist_matches_ips_and_ranges() {
        let whitelist = Whitelist::new(&[
            "127.0.0.1".to_string(),
            "10.8.0.0/16".to_string(),
            "not-a-network".to_string(),
        ]);
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.contains(&IdentityKey::parse("127.0.0.1").unwrap()));
        assert!(whitelist.contains(&IdentityKey::parse("10.8.44.2").unwrap()));
        assert!(!whitelist.contains(&IdentityKey::parse("10.9.0.1").unwrap()));
        assert!(!whitelist.contains(&IdentityKey::unknown()));
    }
}
