//! Host/port splitting for dial targets.

use std::net::IpAddr;

use crate::error::{ConnectError, Result};

/// Splits a dial target into `(host, port)`.
///
/// Rules, applied in order:
/// - an empty target is [`ConnectError::MissingAddress`]
/// - a bare IPv4 or IPv6 literal takes `default_port`
/// - `host:port` splits on the last colon (IPv6 hosts must be bracketed); an empty host becomes
///   `localhost` and an empty port is [`ConnectError::EndsWithColon`]
/// - anything else is retried with `default_port` appended
///
/// Brackets around IPv6 hosts are stripped from the returned host.
///
/// # Errors
///
/// Returns [`ConnectError::MissingAddress`], [`ConnectError::EndsWithColon`], or
/// [`ConnectError::InvalidTarget`] when the target cannot be split.
pub fn parse_target(target: &str, default_port: &str) -> Result<(String, String)> {
    if target.is_empty() {
        return Err(ConnectError::MissingAddress);
    }
    if target.parse::<IpAddr>().is_ok() {
        return Ok((target.to_string(), default_port.to_string()));
    }
    if let Ok((host, port)) = split_host_port(target) {
        if port.is_empty() {
            return Err(ConnectError::EndsWithColon);
        }
        let host = if host.is_empty() { "localhost" } else { host };
        return Ok((host.to_string(), port.to_string()));
    }
    match split_host_port(&format!("{target}:{default_port}")) {
        Ok((host, port)) => Ok((host.to_string(), port.to_string())),
        Err(message) => {
            Err(ConnectError::InvalidTarget { target: target.to_string(), message: message.into() })
        },
    }
}

/// Formats an IP literal for use in a `host:port` address.
///
/// IPv4 addresses are returned as-is, IPv6 addresses are enclosed in brackets. Returns `None`
/// when `host` is not an IP literal.
#[must_use]
pub fn format_ip(host: &str) -> Option<String> {
    host.parse::<IpAddr>().ok().map(format_addr)
}

pub(crate) fn format_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Strips the port and any IPv6 brackets from a `host:port` address.
pub(crate) fn host_of(addr: &str) -> &str {
    let host = addr.rfind(':').map_or(addr, |pos| &addr[..pos]);
    host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host)
}

/// Splits `host:port` with the same rules as a socket address: the port follows the last
/// colon and an IPv6 host must be bracketed.
fn split_host_port(hostport: &str) -> std::result::Result<(&str, &str), &'static str> {
    let colon = hostport.rfind(':').ok_or("missing port in address")?;

    let (host, host_end) = if hostport.starts_with('[') {
        let end = hostport.find(']').ok_or("missing ']' in address")?;
        match end + 1 {
            next if next == hostport.len() => return Err("missing port in address"),
            next if next == colon => {},
            next if hostport.as_bytes()[next] == b':' => return Err("too many colons in address"),
            _ => return Err("missing port in address"),
        }
        (&hostport[1..end], end + 1)
    } else {
        let host = &hostport[..colon];
        if host.contains(':') {
            return Err("too many colons in address");
        }
        (host, 0)
    };

    let after_open = if hostport.starts_with('[') { 1 } else { 0 };
    if hostport[after_open..].contains('[') {
        return Err("unexpected '[' in address");
    }
    if hostport[host_end..].contains(']') {
        return Err("unexpected ']' in address");
    }

    Ok((host, &hostport[colon + 1..]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn parsed(target: &str) -> (String, String) {
        parse_target(target, "443").expect("target should parse")
    }

    #[test]
    fn test_ipv4_literal_takes_default_port() {
        assert_eq!(parsed("192.0.2.1"), ("192.0.2.1".to_string(), "443".to_string()));
    }

    #[test]
    fn test_ipv6_literal_takes_default_port() {
        assert_eq!(parsed("::1"), ("::1".to_string(), "443".to_string()));
        assert_eq!(parsed("2001:db8::1"), ("2001:db8::1".to_string(), "443".to_string()));
    }

    #[test]
    fn test_host_with_port() {
        assert_eq!(parsed("host:80"), ("host".to_string(), "80".to_string()));
        assert_eq!(parsed("[::1]:8443"), ("::1".to_string(), "8443".to_string()));
    }

    #[test]
    fn test_bare_hostname_takes_default_port() {
        assert_eq!(parsed("www.example.com"), ("www.example.com".to_string(), "443".to_string()));
    }

    #[test]
    fn test_bracketed_ipv6_without_port() {
        assert_eq!(parsed("[::1]"), ("::1".to_string(), "443".to_string()));
    }

    #[test]
    fn test_empty_host_defaults_to_localhost() {
        assert_eq!(parsed(":80"), ("localhost".to_string(), "80".to_string()));
    }

    #[test]
    fn test_trailing_colon_is_error() {
        assert!(matches!(parse_target("[::1]:", "443"), Err(ConnectError::EndsWithColon)));
        assert!(matches!(parse_target("host:", "443"), Err(ConnectError::EndsWithColon)));
    }

    #[test]
    fn test_empty_target_is_missing_address() {
        assert!(matches!(parse_target("", "443"), Err(ConnectError::MissingAddress)));
    }

    #[test]
    fn test_unsplittable_target_is_invalid() {
        let err = parse_target("a:b:c", "443").unwrap_err();
        assert!(matches!(err, ConnectError::InvalidTarget { .. }), "got {err:?}");
        assert!(matches!(parse_target("[::1", "443"), Err(ConnectError::InvalidTarget { .. })));
        assert!(matches!(parse_target("ho]st:80", "443"), Err(ConnectError::InvalidTarget { .. })));
    }

    #[test]
    fn test_custom_default_port() {
        assert_eq!(parse_target("db", "3306").unwrap(), ("db".to_string(), "3306".to_string()));
    }

    #[test]
    fn test_format_ip() {
        assert_eq!(format_ip("10.0.0.1").as_deref(), Some("10.0.0.1"));
        assert_eq!(format_ip("::1").as_deref(), Some("[::1]"));
        assert_eq!(format_ip("example.com"), None);
    }

    #[test]
    fn test_host_of_strips_port_and_brackets() {
        assert_eq!(host_of("db.internal:443"), "db.internal");
        assert_eq!(host_of("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(host_of("10.0.0.1:80"), "10.0.0.1");
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Any hostname:port pair splits back into its parts.
            #[test]
            fn prop_host_port_round_trips(
                host in "[a-z][a-z0-9-]{0,20}(\\.[a-z][a-z0-9-]{0,10}){0,3}",
                port in 1u16..,
            ) {
                let (h, p) = parse_target(&format!("{host}:{port}"), "443").unwrap();
                prop_assert_eq!(h, host);
                prop_assert_eq!(p, port.to_string());
            }

            /// Bracketed IPv6 hosts lose their brackets and keep their port.
            #[test]
            fn prop_bracketed_ipv6_splits(segments in proptest::array::uniform8(any::<u16>()), port in 1u16..) {
                let ip = std::net::Ipv6Addr::from(segments);
                let (h, p) = parse_target(&format!("[{ip}]:{port}"), "443").unwrap();
                prop_assert_eq!(h, ip.to_string());
                prop_assert_eq!(p, port.to_string());
            }

            /// Parsing never panics on arbitrary input.
            #[test]
            fn prop_parse_target_total(input in ".{0,40}") {
                let _ = parse_target(&input, "443");
            }
        }
    }
}
