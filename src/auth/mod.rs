//! Authentication helpers
//!
//! Implements timing-safe comparisons, loopback detection, trusted-proxy
//! aware client IP resolution, and the connection role model. The
//! challenge-response primitive lives in [`challenge`].

pub mod challenge;

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Role a client declares in its `connect` request.
///
/// Decided once at handshake success and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Consoles, CLIs, automation agents.
    Interactive,
    /// Worker node, carrying its logical node id.
    Node(String),
}

impl Role {
    /// Wire name used in connect params, presence entries and signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Interactive => "operator",
            Role::Node(_) => "node",
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Role::Interactive => None,
            Role::Node(id) => Some(id.as_str()),
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Role::Node(_))
    }
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Check if an IP address is loopback, including IPv4-mapped IPv6.
pub fn is_loopback_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

/// Trimmed, non-empty header value.
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn normalize_ip(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let trimmed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let ip = trimmed.parse::<IpAddr>().ok()?;
    Some(canonical_ip(ip))
}

/// Collapse IPv4-mapped IPv6 addresses so rate-limit keys are stable.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn parse_forwarded_for(value: Option<&str>) -> Option<IpAddr> {
    let first = value?.split(',').next()?;
    normalize_ip(first)
}

fn is_trusted_proxy(remote: IpAddr, trusted: &[String]) -> bool {
    trusted
        .iter()
        .filter_map(|p| normalize_ip(p))
        .any(|p| p == remote)
}

/// Resolve the client IP for a connection.
///
/// Forwarding headers are honoured only when the direct peer is a
/// configured trusted proxy; otherwise the peer address is authoritative.
pub fn resolve_client_ip(
    remote_addr: SocketAddr,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    trusted: &[String],
) -> IpAddr {
    let remote = canonical_ip(remote_addr.ip());
    if !is_trusted_proxy(remote, trusted) {
        return remote;
    }
    parse_forwarded_for(forwarded_for)
        .or_else(|| real_ip.and_then(normalize_ip))
        .unwrap_or(remote)
}
