//! URL- and DNS-level SSRF filter shared by the media downloader and the
//! router-LLM/router-test outbound calls.
//!
//! Grounded on the private-IP classification in the upstream `web_fetch`
//! tool's `ssrf_check`/`is_private_ip`, extended with the additional ranges,
//! encodings, and hostname-suffix rules the specification requires.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tracing::warn;
use url::Url;

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("URL rejected: {0}")]
    Rejected(String),
    #[error("response exceeded the maximum allowed size of {0} bytes")]
    TooLarge(u64),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Validate a user-supplied URL before any outbound HTTP driven by it.
///
/// Performs scheme checks and hostname/IP-literal classification
/// synchronously, then — for non-IP-literal hosts — resolves DNS and
/// rejects if any resolved address is private (DNS-rebinding defense).
/// Lookup timeouts are treated as non-private to avoid false positives on
/// ephemeral DNS failures.
pub async fn check_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| Error::Rejected(format!("invalid URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => {},
        other => return Err(Error::Rejected(format!("scheme {other} is not allowed"))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Rejected("URL has no host".into()))?;
    let host_lower = host.to_ascii_lowercase();

    if host_lower == "localhost"
        || host_lower == "127.0.0.1"
        || host_lower == "0.0.0.0"
        || host_lower == "::1"
        || host_lower.ends_with(".local")
        || host_lower.ends_with(".internal")
    {
        return Err(Error::Rejected(format!("{host} is a disallowed host")));
    }

    if let Ok(ip) = host_lower.parse::<IpAddr>() {
        // Raw IPv6 literal hosts are default-reject (P10): DNS-resolved IPv6
        // addresses are still allowed through the private-only check below.
        if ip.is_ipv6() {
            return Err(Error::Rejected(format!("{host} is a raw IPv6 literal host, which is not allowed")));
        }
        if is_private_ip(&ip) {
            return Err(Error::Rejected(format!("{host} resolves to private IP {ip}")));
        }
        return Ok(url);
    }

    if let Some(ip) = parse_encoded_ipv4(&host_lower) {
        if is_private_ip(&IpAddr::V4(ip)) {
            return Err(Error::Rejected(format!(
                "{host} decodes to private IP {ip}"
            )));
        }
        return Ok(url);
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let lookup = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio::net::lookup_host(format!("{host}:{port}")),
    )
    .await;

    let addrs: Vec<_> = match lookup {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => return Err(Error::Rejected(format!("DNS resolution failed for {host}: {e}"))),
        Err(_) => {
            warn!(host, "DNS lookup timed out; treating as non-private");
            return Ok(url);
        },
    };

    if addrs.is_empty() {
        return Err(Error::Rejected(format!("DNS resolution failed for {host}")));
    }

    for addr in &addrs {
        if is_private_ip(&addr.ip()) {
            return Err(Error::Rejected(format!(
                "{host} resolves to private IP {}",
                addr.ip()
            )));
        }
    }

    Ok(url)
}

/// Classify an IP address as private/loopback/reserved for SSRF purposes.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(v4: &Ipv4Addr) -> bool {
    if *v4 == Ipv4Addr::new(169, 254, 169, 254) {
        return true;
    }
    let o = v4.octets();
    v4.is_loopback()           // 127/8
        || v4.is_private()     // 10/8, 172.16/12, 192.168/16
        || v4.is_link_local()  // 169.254/16
        || v4.is_broadcast()
        || v4.is_unspecified() // 0.0.0.0
        || o[0] == 0           // 0/8
        || (o[0] == 100 && (o[1] & 0xC0) == 64) // 100.64/10 (CGNAT)
        || (o[0] & 0xF0) == 224 // 224/4 (multicast)
        || (o[0] & 0xF0) == 240 // 240/4 (reserved)
        || (o[0] == 192 && o[1] == 0 && o[2] == 0) // 192.0.0.0/24
}

fn is_private_ipv6(v6: &Ipv6Addr) -> bool {
    if let Some(v4) = v6.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    v6.is_loopback()
        || v6.is_unspecified()
        || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7 unique local
        || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10 link-local
}

/// Decode a hostname that looks like an IPv4 literal using decimal, octal
/// (`0`-prefixed), or hex (`0x`-prefixed) per-octet encodings, e.g.
/// `0177.0.0.1` or `0x7f.0.0.1`. Returns `None` if the string isn't a
/// 4-component numeric-octet literal.
fn parse_encoded_ipv4(host: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        octets[i] = parse_numeric_octet(part)?;
    }
    Some(Ipv4Addr::from(octets))
}

fn parse_numeric_octet(part: &str) -> Option<u8> {
    let value = if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else if part.len() > 1 && part.starts_with('0') {
        u32::from_str_radix(part, 8).ok()?
    } else {
        part.parse::<u32>().ok()?
    };
    u8::try_from(value).ok()
}

/// Download a URL enforcing the SSRF check and a streaming byte cap: chunks
/// are accumulated and checked after each read so the body never needs to be
/// fully materialised before the cap is enforced.
pub async fn download_capped(url_str: &str, max_bytes: u64) -> Result<Vec<u8>> {
    use futures::StreamExt as _;

    let url = check_url(url_str).await?;
    let response = reqwest::get(url).await?;
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 > max_bytes {
            return Err(Error::TooLarge(max_bytes));
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_loopback_and_reserved_v4() {
        for host in [
            "127.0.0.1",
            "0.0.0.0",
            "169.254.169.254",
            "10.0.0.1",
            "172.16.0.1",
            "192.168.1.1",
            "100.64.0.1",
        ] {
            assert!(is_private_ip(&ip(host)), "{host} should be private");
        }
    }

    #[test]
    fn rejects_private_v6() {
        for host in ["::1", "fc00::1", "fe80::1"] {
            assert!(is_private_ip(&ip(host)), "{host} should be private");
        }
    }

    #[test]
    fn rejects_ipv4_mapped_v6() {
        assert!(is_private_ip(&ip("::ffff:127.0.0.1")));
        assert!(is_private_ip(&ip("::ffff:7f00:1")));
    }

    #[test]
    fn allows_public_addresses() {
        for host in ["8.8.8.8", "1.1.1.1"] {
            assert!(!is_private_ip(&ip(host)), "{host} should be public");
        }
    }

    #[test]
    fn decodes_octal_and_hex_encoded_loopback() {
        let octal = parse_encoded_ipv4("0177.0.0.1").unwrap();
        assert!(is_private_ip(&IpAddr::V4(octal)));
        let hex = parse_encoded_ipv4("0x7f.0.0.1").unwrap();
        assert!(is_private_ip(&IpAddr::V4(hex)));
    }

    #[tokio::test]
    async fn check_url_rejects_disallowed_scheme() {
        let result = check_url("ftp://example.com/file").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn check_url_rejects_localhost_literal() {
        let result = check_url("http://127.0.0.1/admin").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn check_url_rejects_local_suffix() {
        let result = check_url("http://printer.local/status").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn check_url_allows_public_host_literal() {
        let result = check_url("https://8.8.8.8/").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn check_url_rejects_public_ipv6_literal_by_default() {
        let result = check_url("http://[2606:4700::1111]/").await;
        assert!(result.is_err());
    }
}
