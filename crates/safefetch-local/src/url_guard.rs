//! URL safety validation (SSRF guard).
//!
//! All checks are string/literal level: no DNS resolution happens here, so a public name that
//! resolves to a private address is not caught. Every redirect target goes through
//! [`UrlGuard::normalize`] again before the next hop is issued.

use crate::config::SecurityConfig;
use safefetch_core::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

pub const MAX_URL_LENGTH: usize = 2048;

/// Exact hostnames that are never fetched.
pub const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "0.0.0.0",
    "127.0.0.1",
    "::",
    "::1",
    // Cloud metadata endpoints.
    "169.254.169.254",
    "169.254.170.2",
    "100.100.100.200",
    "fd00:ec2::254",
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.com",
    "instance-data",
    "instance-data.ec2.internal",
];

/// Hostname suffixes that only resolve inside private networks.
pub const INTERNAL_SUFFIXES: &[&str] = &[
    ".local",
    ".localhost",
    ".localdomain",
    ".internal",
    ".intranet",
    ".lan",
    ".home.arpa",
];

/// A validated URL. Only [`UrlGuard::normalize`] produces one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedUrl {
    url: Url,
    hostname: String,
}

impl NormalizedUrl {
    pub fn href(&self) -> &str {
        self.url.as_str()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.href())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlGuard {
    extra_blocked: HashSet<String>,
    allowed: HashSet<String>,
}

impl UrlGuard {
    pub fn new(cfg: &SecurityConfig) -> Self {
        Self {
            extra_blocked: cfg.blocked_hosts.iter().map(|h| normalize_host(h)).collect(),
            allowed: cfg.allowed_hosts.iter().map(|h| normalize_host(h)).collect(),
        }
    }

    /// Validate and normalize a candidate URL string.
    pub fn normalize(&self, input: &str) -> Result<NormalizedUrl> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(Error::Validation("url must be a non-empty string".into()));
        }
        if raw.len() > MAX_URL_LENGTH {
            return Err(Error::Validation(format!(
                "url exceeds maximum length of {MAX_URL_LENGTH} characters"
            )));
        }
        let url = Url::parse(raw).map_err(|e| Error::Validation(format!("unparsable url: {e}")))?;
        self.check(url)
    }

    /// Validate an already-parsed URL (used for redirect targets).
    pub fn check(&self, mut url: Url) -> Result<NormalizedUrl> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "scheme '{}' is not allowed (use http or https)",
                url.scheme()
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::Validation("credentials in url are not allowed".into()));
        }
        let hostname = url.host_str().map(normalize_host).unwrap_or_default();
        if hostname.is_empty() {
            return Err(Error::Validation("url has no hostname".into()));
        }
        if url.as_str().len() > MAX_URL_LENGTH {
            return Err(Error::Validation(format!(
                "url exceeds maximum length of {MAX_URL_LENGTH} characters"
            )));
        }

        if !self.allowed.contains(&hostname) {
            self.check_host(&url, &hostname)?;
        }

        // Fragments never reach the server; dropping them keeps cache keys stable.
        url.set_fragment(None);
        Ok(NormalizedUrl { url, hostname })
    }

    fn check_host(&self, url: &Url, hostname: &str) -> Result<()> {
        if BLOCKED_HOSTS.contains(&hostname) || self.extra_blocked.contains(hostname) {
            return Err(blocked(hostname));
        }
        match url.host() {
            Some(Host::Ipv4(ip)) if is_blocked_ipv4(ip) => Err(blocked(hostname)),
            Some(Host::Ipv6(ip)) if is_blocked_ipv6(ip) => Err(blocked(hostname)),
            Some(Host::Domain(_)) => {
                if INTERNAL_SUFFIXES.iter().any(|s| hostname.ends_with(s)) {
                    return Err(blocked(hostname));
                }
                // Dotted-quad lookalikes the parser kept as domains (e.g. trailing garbage).
                if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
                    if is_blocked_ipv4(ip) {
                        return Err(blocked(hostname));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn blocked(hostname: &str) -> Error {
    Error::Validation(format!("host '{hostname}' is blocked"))
}

fn normalize_host(h: &str) -> String {
    h.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

pub fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240
}

pub fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let seg = ip.segments();
    // 64:ff9b::/96 NAT64 embeds an IPv4 address in the low 32 bits.
    if seg[0] == 0x64 && seg[1] == 0xff9b && seg[2..6].iter().all(|s| *s == 0) {
        let [.., hi, lo] = seg;
        let v4 = Ipv4Addr::new((hi >> 8) as u8, hi as u8, (lo >> 8) as u8, lo as u8);
        return is_blocked_ipv4(v4);
    }
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (seg[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (seg[0] & 0xffc0) == 0xfe80
        // fec0::/10 deprecated site local
        || (seg[0] & 0xffc0) == 0xfec0
        // 2001:db8::/32 documentation
        || (seg[0] == 0x2001 && seg[1] == 0x0db8)
        // ::/96 IPv4-compatible (deprecated)
        || seg[..6].iter().all(|s| *s == 0)
}
