use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

use crate::access::auth::AuthService;

pub const SESSION_COOKIE: &str = "session_id";
pub const AUTH_COOKIE: &str = "auth_token";

/// Portion of the user agent that feeds the tracking key.
const TRACKING_UA_MAX: usize = 200;

/// The principal a request is attributed to. Exactly one variant per request;
/// an authenticated identity never carries a session token and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Authenticated { principal_id: String },
    Anonymous { session_token: String },
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated { .. })
    }

    pub fn principal_id(&self) -> Option<&str> {
        match self {
            Identity::Authenticated { principal_id } => Some(principal_id),
            Identity::Anonymous { .. } => None,
        }
    }

    pub fn session_token(&self) -> Option<&str> {
        match self {
            Identity::Authenticated { .. } => None,
            Identity::Anonymous { session_token } => Some(session_token),
        }
    }
}

/// Identity plus the request attributes the quota engine needs.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    pub ip: String,
    pub user_agent: String,
    /// Set when a session token was minted during resolution; the HTTP layer
    /// must emit the matching `Set-Cookie` (and only then).
    pub fresh_session_token: Option<String>,
}

/// Derives the secondary correlation signal from IP + user agent.
///
/// Deterministic on purpose: clearing cookies while keeping the same
/// browser/IP combination yields the same key, so ledger sums over it
/// survive a cookie wipe.
pub fn derive_tracking_key(ip: &str, user_agent: &str) -> String {
    let ua: String = user_agent.chars().take(TRACKING_UA_MAX).collect();
    let digest = Sha256::digest(format!("{}:{}", ip, ua).as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Stable principal id for an authenticated caller. The same network address
/// always maps to the same principal while auth is enabled; single-operator
/// auth by design, not a multi-user account system.
pub fn principal_for_ip(ip: &str) -> String {
    let digest = Sha256::digest(ip.as_bytes());
    format!("auth_{}", &hex::encode(digest)[..16])
}

/// Best-effort real client address behind reverse proxies/CDNs.
///
/// Checks CF-Connecting-IP, then the first X-Forwarded-For entry, then
/// X-Real-IP before falling back to the socket peer. These headers are
/// trusted unverified; spoofable when the edge does not strip them. Known
/// limitation, kept for parity with the deployed behavior (see DESIGN.md).
pub fn client_ip(headers: &HeaderMap, peer: IpAddr) -> String {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        return ip.trim().to_string();
    }
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = header_str(headers, "x-real-ip") {
        return ip.trim().to_string();
    }
    peer.to_string()
}

pub fn user_agent(headers: &HeaderMap) -> String {
    header_str(headers, "user-agent").unwrap_or_default().to_string()
}

/// Reads a single cookie out of the `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = header_str(headers, "cookie")?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.trim().to_string());
        }
    }
    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Decides whether the caller is an authenticated principal or an anonymous
/// session-scoped one. Anonymous callers without a durable session cookie get
/// a freshly minted token; emitting the cookie is the caller's job.
pub fn resolve(auth: &AuthService, headers: &HeaderMap, peer: IpAddr) -> ResolvedIdentity {
    let ip = client_ip(headers, peer);
    let user_agent = user_agent(headers);

    let auth_token = cookie_value(headers, AUTH_COOKIE);
    if auth.is_authenticated(auth_token.as_deref()) {
        return ResolvedIdentity {
            identity: Identity::Authenticated {
                principal_id: principal_for_ip(&ip),
            },
            ip,
            user_agent,
            fresh_session_token: None,
        };
    }

    match cookie_value(headers, SESSION_COOKIE) {
        Some(session_token) => ResolvedIdentity {
            identity: Identity::Anonymous { session_token },
            ip,
            user_agent,
            fresh_session_token: None,
        },
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            ResolvedIdentity {
                identity: Identity::Anonymous {
                    session_token: token.clone(),
                },
                ip,
                user_agent,
                fresh_session_token: Some(token),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn tracking_key_is_deterministic() {
        let a = derive_tracking_key("203.0.113.7", "Mozilla/5.0");
        let b = derive_tracking_key("203.0.113.7", "Mozilla/5.0");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn tracking_key_diverges_on_user_agent() {
        let a = derive_tracking_key("203.0.113.7", "Mozilla/5.0");
        let b = derive_tracking_key("203.0.113.7", "curl/8.0");
        assert_ne!(a, b);
    }

    #[test]
    fn tracking_key_caps_user_agent_length() {
        let long = "x".repeat(500);
        let capped = "x".repeat(200);
        assert_eq!(
            derive_tracking_key("203.0.113.7", &long),
            derive_tracking_key("203.0.113.7", &capped)
        );
    }

    #[test]
    fn empty_user_agent_is_valid() {
        let key = derive_tracking_key("203.0.113.7", "");
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn client_ip_prefers_cdn_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.2"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.0.2.1, 10.0.0.2"),
        );
        assert_eq!(client_ip(&headers, peer()), "198.51.100.2");
    }

    #[test]
    fn client_ip_takes_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.0.2.1, 10.0.0.2"),
        );
        assert_eq!(client_ip(&headers, peer()), "192.0.2.1");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.9"));
        assert_eq!(client_ip(&headers, peer()), "192.0.2.9");

        assert_eq!(client_ip(&HeaderMap::new(), peer()), "10.0.0.1");
    }

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("session_id=abc-123; auth_token=tok"),
        );
        assert_eq!(
            cookie_value(&headers, "session_id").as_deref(),
            Some("abc-123")
        );
        assert_eq!(cookie_value(&headers, "auth_token").as_deref(), Some("tok"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn principal_is_stable_per_ip() {
        assert_eq!(principal_for_ip("192.0.2.1"), principal_for_ip("192.0.2.1"));
        assert_ne!(principal_for_ip("192.0.2.1"), principal_for_ip("192.0.2.2"));
        assert!(principal_for_ip("192.0.2.1").starts_with("auth_"));
    }
}
