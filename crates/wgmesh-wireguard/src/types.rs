//! Core value types for `WireGuard` configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};

/// An allowed IP address or network in CIDR notation.
///
/// Host bits are preserved as written (`10.100.3.0/16` stays
/// `10.100.3.0/16`); use [`AllowedIp::route_destination`] for the canonical
/// network form the kernel reports.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedIp {
    network: IpNet,
}

impl AllowedIp {
    /// Creates a single-host network for `ip` (/32 or /128).
    #[must_use]
    pub fn host(ip: IpAddr) -> Self {
        Self {
            network: IpNet::from(ip),
        }
    }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet {
        &self.network
    }

    /// Creates an allowed IP from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self> {
        let network = s
            .parse::<IpNet>()
            .map_err(|e| WireGuardError::InvalidCidr(format!("{s}: {e}")))?;
        Ok(Self { network })
    }

    /// Parses a mesh address: an IP with an optional prefix length. A bare IP
    /// becomes a single-host network.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is neither an IP nor an IP with prefix.
    pub fn from_address(s: &str) -> Result<Self> {
        if s.contains('/') {
            let network = s
                .parse::<IpNet>()
                .map_err(|e| WireGuardError::InvalidAddress(format!("{s:?}: {e}")))?;
            return Ok(Self { network });
        }
        let ip = s
            .parse::<IpAddr>()
            .map_err(|e| WireGuardError::InvalidAddress(format!("{s:?}: {e}")))?;
        Ok(Self::host(ip))
    }

    /// Returns the network with host bits cleared.
    #[must_use]
    pub fn route_destination(&self) -> IpNet {
        self.network.trunc()
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String {
        self.network.to_string()
    }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// A `WireGuard` peer endpoint: a host (IP literal or DNS name) and a port.
///
/// Names are kept as parsed until [`Endpoint::resolve`] turns them into an
/// address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a socket address.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            host: address.ip().to_string(),
            port: address.port(),
        }
    }

    /// Returns the host part.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the socket address when the host is an IP literal.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolves a named host to an IP endpoint, preferring IPv4.
    ///
    /// IP literals are returned unchanged without a lookup.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::InvalidEndpoint`] if the lookup fails or
    /// yields no addresses.
    pub async fn resolve(&self) -> Result<Self> {
        if self.socket_addr().is_some() {
            return Ok(self.clone());
        }
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| WireGuardError::InvalidEndpoint(format!("{self}: cannot resolve: {e}")))?
            .collect();
        addresses
            .iter()
            .find(|address| address.is_ipv4())
            .or_else(|| addresses.first())
            .map(|address| Self::new(*address))
            .ok_or_else(|| WireGuardError::InvalidEndpoint(format!("{self}: no addresses")))
    }
}

fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl FromStr for Endpoint {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(address) = s.parse::<SocketAddr>() {
            if address.port() == 0 {
                return Err(WireGuardError::InvalidEndpoint(format!("{s}: port 0")));
            }
            return Ok(Self::new(address));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireGuardError::InvalidEndpoint(format!("{s:?}: missing port")))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| WireGuardError::InvalidEndpoint(format!("{s:?}: invalid port")))?;
        if !is_hostname(host) {
            return Err(WireGuardError::InvalidEndpoint(format!(
                "{s:?}: invalid host"
            )));
        }
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Attributes attached to every route installed for the mesh interface.
///
/// `None` leaves the kernel default in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Route metric (priority).
    pub metric: Option<u32>,
    /// Route protocol tag.
    pub protocol: Option<u8>,
    /// Routing table id.
    pub table: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn bare_ipv4_becomes_host_route() {
        let addr = AllowedIp::from_address("10.100.0.1").expect("valid");
        assert_eq!(addr.to_cidr(), "10.100.0.1/32");
    }

    #[test]
    fn bare_ipv6_becomes_host_route() {
        let addr = AllowedIp::from_address("fd00::1").expect("valid");
        assert_eq!(addr.to_cidr(), "fd00::1/128");
    }

    #[test]
    fn address_with_prefix_is_kept() {
        let addr = AllowedIp::from_address("10.100.0.1/24").expect("valid");
        assert_eq!(addr.to_cidr(), "10.100.0.1/24");
        assert_eq!(addr.route_destination().to_string(), "10.100.0.0/24");
    }

    #[test_case("" ; "empty")]
    #[test_case("10.100.0" ; "truncated")]
    #[test_case("10.100.0.1/40" ; "prefix too long")]
    #[test_case("host.example" ; "hostname")]
    fn invalid_addresses(input: &str) {
        assert!(matches!(
            AllowedIp::from_address(input),
            Err(WireGuardError::InvalidAddress(_))
        ));
    }

    #[test]
    fn cidr_preserves_host_bits() {
        let cidr = AllowedIp::from_cidr("10.100.3.0/16").expect("valid");
        assert_eq!(cidr.to_string(), "10.100.3.0/16");
        assert_eq!(cidr.route_destination().to_string(), "10.100.0.0/16");
    }

    #[test_case("10.0.0.1" ; "no prefix")]
    #[test_case("10.0.0.0/33" ; "prefix too long")]
    #[test_case("garbage/8" ; "not an ip")]
    fn invalid_cidrs(input: &str) {
        assert!(matches!(
            AllowedIp::from_cidr(input),
            Err(WireGuardError::InvalidCidr(_))
        ));
    }

    #[test_case("35.12.23.34:555", "35.12.23.34", 555 ; "ipv4")]
    #[test_case("[fd00::1]:51820", "fd00::1", 51820 ; "ipv6")]
    #[test_case("vpn.Example.com:51820", "vpn.example.com", 51820 ; "hostname")]
    fn valid_endpoints(input: &str, host: &str, port: u16) {
        let endpoint: Endpoint = input.parse().expect("valid endpoint");
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
    }

    #[test_case("35.12.23.34" ; "missing port")]
    #[test_case("35.12.23.34:0" ; "port zero")]
    #[test_case("35.12.23.34:70000" ; "port overflow")]
    #[test_case(":51820" ; "empty host")]
    #[test_case("bad_host:51820" ; "underscore")]
    #[test_case("" ; "empty")]
    fn invalid_endpoints(input: &str) {
        assert!(matches!(
            input.parse::<Endpoint>(),
            Err(WireGuardError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn endpoint_display_roundtrips_text() {
        for text in ["35.12.23.34:555", "[fd00::1]:51820", "vpn.example.com:51820"] {
            let endpoint: Endpoint = text.parse().expect("valid");
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn endpoint_socket_addr_only_for_ip_hosts() {
        let ip: Endpoint = "35.12.23.34:555".parse().expect("valid");
        assert!(ip.socket_addr().is_some());
        let name: Endpoint = "vpn.example.com:555".parse().expect("valid");
        assert!(name.socket_addr().is_none());
    }

    #[tokio::test]
    async fn resolve_keeps_ip_literals() {
        let endpoint: Endpoint = "35.12.23.34:555".parse().expect("valid");
        assert_eq!(endpoint.resolve().await.expect("literal"), endpoint);
    }

    #[tokio::test]
    async fn resolve_looks_up_names() {
        let endpoint: Endpoint = "localhost:51820".parse().expect("valid");
        let resolved = endpoint.resolve().await.expect("localhost resolves");
        assert!(resolved.socket_addr().is_some_and(|a| a.ip().is_loopback()));
        assert_eq!(resolved.port(), 51820);
    }

    #[tokio::test]
    async fn resolve_fails_for_unknown_names() {
        let endpoint: Endpoint = "no-such-host.invalid:51820".parse().expect("valid");
        let err = endpoint.resolve().await.expect_err("reserved TLD");
        assert!(matches!(err, WireGuardError::InvalidEndpoint(_)));
        assert!(err.to_string().contains("no-such-host.invalid:51820"));
    }
}
