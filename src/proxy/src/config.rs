use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// How many bytes each side is peeked for parser selection.
pub const PEEK_LEN: usize = 5;

/// A single egress bypass rule. A flow whose destination matches every
/// populated field is tunneled verbatim instead of being parsed.
#[derive(Debug, Clone, Default)]
pub struct BypassRule {
    pub host: Option<Regex>,
    /// 0 matches any port.
    pub port: u16,
    pub path: Option<Regex>,
}

impl BypassRule {
    pub fn matches(&self, host: &str, port: u16, path: &str) -> bool {
        if self.port != 0 && self.port != port {
            return false;
        }
        if let Some(host_re) = &self.host {
            if !host_re.is_match(host) {
                return false;
            }
        }
        if let Some(path_re) = &self.path {
            if !path_re.is_match(path) {
                return false;
            }
        }
        true
    }
}

/// Runtime configuration of the interception core. CLI and file loading
/// live outside the proxy crate; this struct is what they produce.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub proxy_port: u16,
    pub dns_port: u16,
    /// Addresses announced by the DNS responder for intercepted names.
    pub announce_ipv4: Ipv4Addr,
    pub announce_ipv6: Ipv6Addr,
    /// Tunnel every flow without parsing.
    pub pass_through: bool,
    pub bypass_rules: Vec<BypassRule>,
    /// Deadline for the initial dual-side peek.
    pub peek_timeout: Duration,
    /// Graceful parser wind-down bound after cancellation.
    pub wait_delay: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_port: 16789,
            dns_port: 26789,
            announce_ipv4: Ipv4Addr::LOCALHOST,
            announce_ipv6: Ipv6Addr::LOCALHOST,
            pass_through: false,
            bypass_rules: vec![],
            peek_timeout: Duration::from_millis(10),
            wait_delay: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_rule_matching() {
        let rule = BypassRule {
            host: Some(Regex::new(r"^.*\.internal$").unwrap()),
            port: 8080,
            path: None,
        };
        assert!(rule.matches("db.internal", 8080, "/any"));
        assert!(!rule.matches("db.internal", 9090, "/any"));
        assert!(!rule.matches("db.example.com", 8080, "/any"));

        let any_port = BypassRule {
            host: None,
            port: 0,
            path: Some(Regex::new("^/health").unwrap()),
        };
        assert!(any_port.matches("whatever", 1, "/healthz"));
        assert!(!any_port.matches("whatever", 1, "/metrics"));
    }
}
