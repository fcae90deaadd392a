use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

/// Creates a truncated, salted hash of an identifier for safe logging.
///
/// # Arguments
/// * `id` - The identifier to hash (e.g., username, user id).
/// * `salt` - A salt value from the application's configuration.
///
/// # Returns
/// A short, hexadecimal string representing the salted hash.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let hash = hasher.finalize();

    hash[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// Extracts client IP address from HTTP request headers.
///
/// Checks headers in order of priority:
/// 1. X-Forwarded-For (first IP in the chain, if present)
/// 2. X-Real-IP (single IP, if present)
/// 3. Falls back to the direct connection IP
///
/// # Security Note
/// X-Forwarded-For can be spoofed by clients, so it should only be trusted
/// if the request comes through a trusted reverse proxy that strips any
/// existing X-Forwarded-For from untrusted sources.
pub fn extract_client_ip(headers: &HeaderMap, direct_ip: Option<IpAddr>) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            // "client, proxy1, proxy2" - the first entry is the original client
            let first_ip = forwarded_str.split(',').next().unwrap_or("").trim();
            if let Ok(ip) = first_ip.parse::<IpAddr>() {
                return normalize_ip(ip);
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            if let Ok(ip) = real_ip_str.trim().parse::<IpAddr>() {
                return normalize_ip(ip);
            }
        }
    }

    if let Some(ip) = direct_ip {
        return normalize_ip(ip);
    }

    "unknown".to_string()
}

/// Normalizes IP address to string format (removes brackets for IPv6).
fn normalize_ip(ip: IpAddr) -> String {
    ip.to_string()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Whether this request is a WebSocket handshake.
///
/// WebSocket sessions carry their token out-of-band (query parameter), so the
/// HTTP auth/RBAC stages step aside and the upgrade handler re-authenticates.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Adds baseline security headers to a response header map.
/// HSTS is added only when the request arrived over HTTPS (via proxy header).
pub fn add_security_headers(headers: &mut HeaderMap, is_https: bool) {
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    if is_https {
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
}

/// Extract the `sub` claim from a JWT without verifying the signature.
///
/// Used only for rate-limit keying on the refresh endpoint, where the caller's
/// access token may already be expired but still identifies the account being
/// refreshed. Never use this for authentication decisions.
pub fn extract_sub_unverified(token: &str) -> Option<String> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    let payload_bytes = URL_SAFE_NO_PAD.decode(parts[1]).ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes).ok()?;

    payload
        .get("sub")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(extract_client_ip(&headers, None), "203.0.113.7");
    }

    #[test]
    fn real_ip_used_when_no_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(extract_client_ip(&headers, None), "198.51.100.2");
    }

    #[test]
    fn falls_back_to_peer_address() {
        let headers = HeaderMap::new();
        let peer = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(extract_client_ip(&headers, Some(peer)), "127.0.0.1");
    }

    #[test]
    fn garbage_forwarded_for_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let peer = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(extract_client_ip(&headers, Some(peer)), "192.168.1.5");
    }

    #[test]
    fn log_safe_id_is_stable_and_salted() {
        let a = log_safe_id("user-1", "salt");
        let b = log_safe_id("user-1", "salt");
        let c = log_safe_id("user-1", "other-salt");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn unverified_sub_extraction() {
        // header {"alg":"HS256"} . payload {"sub":"abc","role":"viewer"} . sig
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"abc","role":"viewer"}"#);
        let token = format!("e30.{payload}.sig");
        assert_eq!(extract_sub_unverified(&token), Some("abc".to_string()));
        assert_eq!(extract_sub_unverified("not-a-jwt"), None);
    }
}
