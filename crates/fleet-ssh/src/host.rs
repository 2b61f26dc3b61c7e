//! Host addressing.
//!
//! Hosts are supplied as strings (`web1`, `web1:2222`, `10.0.0.5`,
//! `[fec2::10]:55`). The string as supplied is the host's identity and is the
//! key used in every result map.

use std::fmt;

use crate::error::{FleetError, FleetResult};

/// A parsed `hostname[:port]` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddr {
    /// The host string exactly as supplied.
    identity: String,
    /// Hostname or IP address, without brackets.
    hostname: String,
    /// TCP port.
    port: u16,
}

impl HostAddr {
    /// Parse a host string, using `default_port` when none is given.
    ///
    /// Bare IPv6 addresses (more than one `:` and no brackets) are taken as
    /// having no port.
    pub fn parse(input: &str, default_port: u16) -> FleetResult<Self> {
        let identity = input.trim();
        if identity.is_empty() {
            return Err(invalid(input, "empty host"));
        }

        let (hostname, port) = if let Some(rest) = identity.strip_prefix('[') {
            let (addr, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(input, "missing closing bracket"))?;
            let port = match tail {
                "" => None,
                _ => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| invalid(input, "unexpected text after bracket"))?,
                ),
            };
            (addr, port)
        } else if identity.matches(':').count() > 1 {
            (identity, None)
        } else {
            match identity.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (identity, None),
            }
        };

        if hostname.is_empty() {
            return Err(invalid(input, "empty hostname"));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid(input, format!("invalid port {p:?}")))?,
            None => default_port,
        };

        Ok(Self {
            identity: identity.to_string(),
            hostname: hostname.to_string(),
            port,
        })
    }

    /// The host string as supplied; the result map key.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Hostname or IP address.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Replace the port, keeping the identity.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

fn invalid(host: &str, reason: impl Into<String>) -> FleetError {
    FleetError::InvalidHost {
        host: host.to_string(),
        reason: reason.into(),
    }
}

/// Split a comma separated host parameter (`"a, b,c:2222"`).
#[must_use]
pub fn parse_host_list(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse every host, dropping duplicates after the first occurrence.
pub fn parse_hosts<I, S>(hosts: I, default_port: u16) -> FleetResult<Vec<HostAddr>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed: Vec<HostAddr> = Vec::new();
    for host in hosts {
        let addr = HostAddr::parse(host.as_ref(), default_port)?;
        if parsed.iter().any(|h| h.identity == addr.identity) {
            tracing::warn!(host = %addr, "Duplicate host in host list, ignoring");
            continue;
        }
        parsed.push(addr);
    }
    if parsed.is_empty() {
        return Err(FleetError::EmptyHostList);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plain_host_uses_default_port() {
        let h = HostAddr::parse("1.2.3.4", 22).unwrap();
        assert_eq!(h.hostname(), "1.2.3.4");
        assert_eq!(h.port(), 22);
        assert_eq!(h.identity(), "1.2.3.4");
    }

    #[test]
    fn host_with_port() {
        let h = HostAddr::parse("web1:2222", 22).unwrap();
        assert_eq!(h.hostname(), "web1");
        assert_eq!(h.port(), 2222);
        assert_eq!(h.to_string(), "web1:2222");
    }

    #[test]
    fn bracketed_ipv6() {
        let h = HostAddr::parse("[fec2::10]:55", 22).unwrap();
        assert_eq!(h.hostname(), "fec2::10");
        assert_eq!(h.port(), 55);

        let h = HostAddr::parse("[::1]", 2200).unwrap();
        assert_eq!(h.hostname(), "::1");
        assert_eq!(h.port(), 2200);
    }

    #[test]
    fn bare_ipv6_has_no_port() {
        let h = HostAddr::parse("fec2::10", 22).unwrap();
        assert_eq!(h.hostname(), "fec2::10");
        assert_eq!(h.port(), 22);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(HostAddr::parse("", 22).is_err());
        assert!(HostAddr::parse("web:abc", 22).is_err());
        assert!(HostAddr::parse("web:0", 22).is_err());
        assert!(HostAddr::parse("[::1", 22).is_err());
        assert!(HostAddr::parse(":22", 22).is_err());
    }

    #[test]
    fn host_list_splitting() {
        assert_eq!(parse_host_list("a, b,,c:2222 "), vec!["a", "b", "c:2222"]);
        assert!(parse_host_list(" , ").is_empty());
    }

    #[test]
    fn duplicates_are_dropped() {
        let hosts = parse_hosts(["a", "b", "a"], 22).unwrap();
        assert_eq!(hosts.len(), 2);
        assert!(matches!(
            parse_hosts(Vec::<String>::new(), 22),
            Err(FleetError::EmptyHostList)
        ));
    }

    proptest! {
        #[test]
        fn name_and_port_roundtrip(name in "[a-z][a-z0-9-]{0,20}", port in 1u16..) {
            let h = HostAddr::parse(&format!("{name}:{port}"), 22).unwrap();
            prop_assert_eq!(h.hostname(), name.as_str());
            prop_assert_eq!(h.port(), port);
        }
    }
}
