//! Outbound URL authorization.
//!
//! Every URL the server dereferences on behalf of an API caller (index,
//! product document, artifact, redirect hop) is checked here first. The
//! check resolves the host once and hands the validated addresses back so the
//! HTTP client can pin its connection to them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use reqwest::Url;

use crate::error::{Result, ServerError};

/// A URL that passed the guard, with the addresses it may connect to
#[derive(Debug, Clone)]
pub struct AuthorizedTarget {
    pub url: Url,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamGuard {
    allow_private: bool,
}

impl UpstreamGuard {
    pub fn new(allow_private: bool) -> Self {
        Self { allow_private }
    }

    /// Syntactic checks only: scheme, host presence, localhost names, IP literals
    pub fn check_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ServerError::UpstreamBlocked(format!("invalid URL {:?}: {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ServerError::UpstreamBlocked(format!(
                    "scheme {:?} is not allowed",
                    other
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ServerError::UpstreamBlocked(format!("URL {} has no host", url)))?
            .to_ascii_lowercase();

        if self.allow_private {
            return Ok(url);
        }

        let bare = host.trim_end_matches('.');
        if bare == "localhost" || bare.ends_with(".localhost") {
            return Err(ServerError::UpstreamBlocked(format!(
                "host {} is not allowed",
                host
            )));
        }

        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            if is_forbidden_ip(ip) {
                return Err(ServerError::UpstreamBlocked(format!(
                    "address {} is not allowed",
                    ip
                )));
            }
        }

        Ok(url)
    }

    /// Full authorization: syntactic checks, then DNS resolution of the host
    pub async fn authorize(&self, raw: &str) -> Result<AuthorizedTarget> {
        let url = self.check_url(raw)?;
        let host = host_of(&url)?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ServerError::UpstreamBlocked(format!("URL {} has no port", url)))?;

        let lookup_host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((lookup_host.as_str(), port))
            .await
            .map_err(|e| {
                ServerError::UpstreamUnreachable(format!("failed to resolve {}: {}", host, e))
            })?
            .collect();

        self.authorize_addrs(url, addrs)
    }

    /// Validate already-resolved addresses for `url`
    pub fn authorize_addrs(&self, url: Url, addrs: Vec<SocketAddr>) -> Result<AuthorizedTarget> {
        let host = host_of(&url)?;
        if addrs.is_empty() {
            return Err(ServerError::UpstreamUnreachable(format!(
                "{} did not resolve to any address",
                host
            )));
        }

        if !self.allow_private {
            // Any forbidden address poisons the whole name
            if let Some(bad) = addrs.iter().find(|a| is_forbidden_ip(a.ip())) {
                return Err(ServerError::UpstreamBlocked(format!(
                    "{} resolves to forbidden address {}",
                    host,
                    bad.ip()
                )));
            }
        }

        Ok(AuthorizedTarget { url, host, addrs })
    }
}

fn host_of(url: &Url) -> Result<String> {
    url.host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| ServerError::UpstreamBlocked(format!("URL {} has no host", url)))
}

/// Addresses an upstream mirror must never point at
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

/// IPv4 address carried inside an IPv6 one: mapped `::ffff:a.b.c.d`,
/// NAT64 `64:ff9b::a.b.c.d` and the deprecated compatible `::a.b.c.d`
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let [s0, s1, s2, s3, s4, s5, s6, s7] = ip.segments();
    let low = Ipv4Addr::new((s6 >> 8) as u8, s6 as u8, (s7 >> 8) as u8, s7 as u8);
    match (s0, s1, s2, s3, s4, s5) {
        (0x64, 0xff9b, 0, 0, 0, 0) => Some(low),
        (0, 0, 0, 0, 0, 0) => Some(low),
        _ => None,
    }
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = embedded_v4(ip) {
        return is_forbidden_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00 // fc00::/7
        || (first & 0xffc0) == 0xfe80 // fe80::/10
}
