//! Caller network address extraction.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Forwarding headers consulted in order, lower-cased.
pub const FORWARDING_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "proxy-client-ip",
    "wl-proxy-client-ip",
];

/// Placeholder some proxies write when they do not know the client.
const UNKNOWN: &str = "unknown";

/// Extract the caller's address.
///
/// The first usable forwarding header wins; otherwise the raw connection
/// address is used. `headers` must be keyed by lower-cased header name.
/// Returns `None` when nothing usable is present.
pub fn client_ip(headers: &HashMap<String, String>, remote_addr: Option<&str>) -> Option<String> {
    for name in FORWARDING_HEADERS {
        let Some(value) = headers.get(*name) else {
            continue;
        };

        // X-Forwarded-For is a list; the leftmost entry is the original client.
        let candidate = value.split(',').next().unwrap_or_default().trim();
        if is_usable(candidate) {
            return Some(candidate.to_string());
        }
    }

    let remote = remote_addr?.trim();
    if !is_usable(remote) {
        return None;
    }

    match remote.parse::<SocketAddr>() {
        Ok(addr) => Some(addr.ip().to_string()),
        Err(_) => Some(remote.to_string()),
    }
}

fn is_usable(value: &str) -> bool {
    !value.is_empty() && !value.eq_ignore_ascii_case(UNKNOWN)
}
