// Outbound URL policy for the image proxy: SSRF guard and recursive-call unwrap

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "0.0.0.0",
    "metadata",
    "metadata.google.internal",
    "metadata.gke.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

const BLOCKED_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16", // link-local, cloud metadata
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("scheme '{0}' is not allowed")]
    DisallowedScheme(String),

    #[error("URL has no host")]
    NoHost,

    #[error("host '{0}' is blocked")]
    BlockedHost(String),

    #[error("address {0} is in a blocked range")]
    BlockedAddress(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("proxy URL is missing its '{0}' parameter")]
    MissingProxyTarget(String),

    #[error("proxy URL nested more than {0} levels deep")]
    TooManyUnwraps(usize),
}

/// Decides whether an outbound fetch target is safe to request.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    allowed_schemes: HashSet<String>,
    blocked_hosts: HashSet<String>,
    blocked_cidrs: Vec<IpNet>,
    allowed_hosts: HashSet<String>,
    resolve_dns: bool,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlValidator {
    pub fn new() -> Self {
        Self {
            allowed_schemes: ["http", "https"].into_iter().map(String::from).collect(),
            blocked_hosts: BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
            blocked_cidrs: BLOCKED_CIDRS.iter().filter_map(|c| c.parse().ok()).collect(),
            allowed_hosts: HashSet::new(),
            resolve_dns: false,
        }
    }

    /// Hosts on the allow-list skip every host and address check.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    pub fn block_host(mut self, host: impl Into<String>) -> Self {
        self.blocked_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    pub fn block_cidr(mut self, cidr: IpNet) -> Self {
        self.blocked_cidrs.push(cidr);
        self
    }

    /// Also resolve host names and reject those pointing into blocked ranges.
    pub fn with_dns_check(mut self, enabled: bool) -> Self {
        self.resolve_dns = enabled;
        self
    }

    fn is_allowed_host(&self, url: &Url) -> bool {
        url.host_str()
            .map(|h| self.allowed_hosts.contains(&h.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), ValidationError> {
        let mapped = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };
        for candidate in std::iter::once(ip).chain(mapped) {
            if self.blocked_cidrs.iter().any(|cidr| cidr.contains(&candidate)) {
                return Err(ValidationError::BlockedAddress(ip.to_string()));
            }
        }
        Ok(())
    }

    /// Syntactic check: scheme, host names and literal addresses.
    pub fn validate(&self, raw: &str) -> Result<Url, ValidationError> {
        let url = Url::parse(raw.trim()).map_err(|_| ValidationError::InvalidUrl(raw.to_string()))?;

        if !self.allowed_schemes.contains(url.scheme()) {
            return Err(ValidationError::DisallowedScheme(url.scheme().to_string()));
        }

        let host = url.host().ok_or(ValidationError::NoHost)?;
        if self.is_allowed_host(&url) {
            return Ok(url);
        }

        match host {
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if self.blocked_hosts.contains(&domain) || domain.ends_with(".localhost") {
                    return Err(ValidationError::BlockedHost(domain));
                }
            }
            Host::Ipv4(v4) => self.check_ip(IpAddr::V4(v4))?,
            Host::Ipv6(v6) => self.check_ip(IpAddr::V6(v6))?,
        }

        Ok(url)
    }

    /// `validate` plus, when enabled, a DNS lookup so names that resolve into
    /// blocked ranges are refused too.
    pub async fn validate_resolved(&self, raw: &str) -> Result<Url, ValidationError> {
        let url = self.validate(raw)?;
        if !self.resolve_dns || self.is_allowed_host(&url) {
            return Ok(url);
        }
        let Some(Host::Domain(domain)) = url.host() else {
            return Ok(url);
        };

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((domain, port))
            .await
            .map_err(|e| ValidationError::DnsResolution(e.to_string()))?;
        for addr in addrs {
            self.check_ip(addr.ip())?;
        }
        Ok(url)
    }
}

/// Path and query parameter that identify a call to the image proxy itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySignature {
    pub path: String,
    pub param: String,
}

impl Default for ProxySignature {
    fn default() -> Self {
        Self {
            path: "/api/image-proxy".to_string(),
            param: "url".to_string(),
        }
    }
}

impl ProxySignature {
    /// The wrapped target when `url` is a call to this proxy.
    fn wrapped_target(&self, url: &Url) -> Option<Result<String, ValidationError>> {
        let path = url.path();
        let wanted = self.path.trim_end_matches('/');
        if path.trim_end_matches('/') != wanted {
            return None;
        }
        let target = url
            .query_pairs()
            .find(|(key, _)| *key == self.param.as_str())
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingProxyTarget(self.param.clone()));
        Some(target)
    }
}

/// Strip proxy-of-proxy wrapping until the innermost original URL remains.
/// Relative proxy paths such as `/api/image-proxy?url=...` count as wrapping.
pub fn unwrap_proxy_target(
    raw: &str,
    signature: &ProxySignature,
    max_unwraps: usize,
) -> Result<String, ValidationError> {
    let placeholder_base = Url::parse("http://proxy.invalid/")
        .map_err(|_| ValidationError::InvalidUrl(raw.to_string()))?;

    let mut current = raw.trim().to_string();
    let mut unwraps = 0;
    loop {
        let parsed = match Url::parse(&current) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) if current.starts_with('/') => placeholder_base
                .join(&current)
                .map_err(|_| ValidationError::InvalidUrl(current.clone()))?,
            Err(_) => return Ok(current),
        };

        match signature.wrapped_target(&parsed) {
            None => return Ok(current),
            Some(inner) => {
                unwraps += 1;
                if unwraps > max_unwraps {
                    return Err(ValidationError::TooManyUnwraps(max_unwraps));
                }
                current = inner?.trim().to_string();
            }
        }
    }
}
