//! Registry and artifact URL validation.
//!
//! Every URL the runtime fetches from (the registry manifest and each
//! platform artifact) passes through [`validate_registry_url`] first.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;

use super::names::ValidationError;

/// Upper bound on the textual length of a registry or artifact URL.
pub const MAX_URL_LEN: usize = 2048;

/// Parse and validate a registry or artifact URL.
///
/// Rejects URLs that are too long, unparsable, use a scheme other than
/// `http`/`https`, carry credentials, or (unless `allow_private` is set)
/// point at localhost or a private/link-local network address.
pub fn validate_registry_url(raw: &str, allow_private: bool) -> Result<Url, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }
    if raw.len() > MAX_URL_LEN {
        return Err(ValidationError::InvalidUrl(format!(
            "URL is {} bytes, maximum {}",
            raw.len(),
            MAX_URL_LEN
        )));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidUrl(
            "URL contains control characters".to_string(),
        ));
    }

    let parsed = Url::parse(raw).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::DisallowedScheme(other.to_string())),
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(ValidationError::InvalidUrl(
            "URL must not embed credentials".to_string(),
        ));
    }

    let Some(host) = parsed.host_str() else {
        return Err(ValidationError::InvalidUrl("URL has no host".to_string()));
    };

    if !allow_private && is_blocked_host(host) {
        return Err(ValidationError::PrivateHost(host.to_string()));
    }

    Ok(parsed)
}

fn is_blocked_host(host: &str) -> bool {
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_private_or_local_ip(ip);
    }

    false
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => is_private_or_local_ipv4(addr),
        IpAddr::V6(addr) => {
            if let Some(mapped) = addr.to_ipv4_mapped() {
                return is_private_or_local_ipv4(mapped);
            }
            is_private_or_local_ipv6(addr)
        }
    }
}

fn is_private_or_local_ipv4(addr: Ipv4Addr) -> bool {
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_unspecified()
        || addr.octets()[0] == 0
}

fn is_private_or_local_ipv6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];

    addr.is_loopback()
        || addr.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || (first & 0xff00) == 0xff00
}
