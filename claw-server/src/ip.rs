//! Client IP extraction. The direct TCP peer address is always trusted;
//! an `X-Forwarded-For` header is only consulted when that peer falls
//! inside a configured trusted-proxy CIDR set — empty by default, which
//! means the header is never trusted out of the box.

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Parse the comma-separated CIDR list from `Settings::trusted_proxy_cidrs`.
/// A block that fails to parse is logged and skipped rather than rejecting
/// the whole set.
pub fn parse_trusted_cidrs(raw: &str) -> Vec<IpNet> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!(cidr = s, error = %e, "ignoring unparseable trusted_proxy_cidrs entry");
                None
            }
        })
        .collect()
}

/// Resolve the client address to record/rate-limit against: `peer` unless
/// it is a trusted proxy and `X-Forwarded-For` is present, in which case
/// the left-most (original client) address in that header is used.
pub fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> String {
    if trusted.iter().any(|net| net.contains(&peer)) {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }
    }
    peer.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn untrusted_peer_ignores_forwarded_header() {
        let trusted = parse_trusted_cidrs("");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9"));
        let peer: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(client_ip(peer, &headers, &trusted), "1.2.3.4");
    }

    #[test]
    fn trusted_peer_honors_forwarded_header() {
        let trusted = parse_trusted_cidrs("10.0.0.0/8");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 10.0.0.1"));
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(client_ip(peer, &headers, &trusted), "9.9.9.9");
    }

    #[test]
    fn malformed_cidr_is_skipped_not_fatal() {
        let trusted = parse_trusted_cidrs("not-a-cidr, 127.0.0.1/32");
        assert_eq!(trusted.len(), 1);
    }
}
