//! `WireGuard` interface configuration and its text renderings.
//!
//! [`render_config`] produces the INI-style document persisted for external
//! tooling, [`redact_config`] the same document with the private key zeroed
//! for logs, and [`render_device_config`] the `wg setconf` form pushed to the
//! kernel. Equal configurations always render to identical bytes.

use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;

use ipnet::IpNet;

use crate::keys::{PrivateKey, PublicKey, KEY_SIZE};
use crate::types::{AllowedIp, Endpoint, RoutePolicy};

/// Smallest MTU accepted for the mesh interface.
pub const MIN_MTU: u16 = 576;

/// Configuration for a `WireGuard` interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// The interface's private key.
    pub private_key: PrivateKey,
    /// Address assigned to the interface.
    pub address: AllowedIp,
    /// Listen port, servers only.
    pub listen_port: Option<u16>,
    /// Link MTU, kernel default when unset.
    pub mtu: Option<u16>,
    /// Peers in canonical order.
    pub peers: Vec<PeerConfig>,
    /// Attributes for routes installed toward peers.
    pub routing: RoutePolicy,
}

impl InterfaceConfig {
    /// Creates a configuration with no peers.
    #[must_use]
    pub fn new(private_key: PrivateKey, address: AllowedIp) -> Self {
        Self {
            private_key,
            address,
            listen_port: None,
            mtu: None,
            peers: Vec::new(),
            routing: RoutePolicy::default(),
        }
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Sets the link MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Sets the route policy.
    #[must_use]
    pub fn with_routing(mut self, routing: RoutePolicy) -> Self {
        self.routing = routing;
        self
    }

    /// Returns the public key matching the private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// Returns every route destination the peers need, keyed by canonical
    /// network, together with the first peer claiming it.
    #[must_use]
    pub fn route_destinations(&self) -> BTreeMap<IpNet, PublicKey> {
        let mut routes = BTreeMap::new();
        for peer in &self.peers {
            for allowed in &peer.allowed_ips {
                routes
                    .entry(allowed.route_destination())
                    .or_insert(peer.public_key);
            }
        }
        routes
    }
}

/// Configuration for a `WireGuard` peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Allowed IPs for this peer, in declaration order.
    pub allowed_ips: Vec<AllowedIp>,
    /// Endpoint, servers only.
    pub endpoint: Option<Endpoint>,
}

impl PeerConfig {
    /// Creates a new peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
        }
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    fn joined_allowed_ips(&self) -> String {
        let ips: Vec<String> = self.allowed_ips.iter().map(AllowedIp::to_cidr).collect();
        ips.join(", ")
    }
}

fn render_with_key(config: &InterfaceConfig, private_key: &str) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");
    let _ = writeln!(output, "Address = {}", config.address);
    let _ = writeln!(output, "PrivateKey = {private_key}");
    if let Some(port) = config.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }
    if let Some(mtu) = config.mtu {
        let _ = writeln!(output, "MTU = {mtu}");
    }

    for peer in &config.peers {
        output.push_str("\n[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key);
        let _ = writeln!(output, "AllowedIps = {}", peer.joined_allowed_ips());
        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }
    }

    output
}

/// Renders the configuration document, including the private key.
#[must_use]
pub fn render_config(config: &InterfaceConfig) -> String {
    render_with_key(config, &config.private_key.to_base64())
}

/// Renders the configuration document with an all-zero private key.
#[must_use]
pub fn redact_config(config: &InterfaceConfig) -> String {
    let zero = PrivateKey::from_bytes_array([0u8; KEY_SIZE]);
    render_with_key(config, &zero.to_base64())
}

/// Renders the configuration in the form accepted by `wg setconf`.
///
/// Interface addresses are not part of the device layer and are omitted.
#[must_use]
pub fn render_device_config(config: &InterfaceConfig) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");
    let _ = writeln!(output, "PrivateKey = {}", config.private_key.to_base64());
    if let Some(port) = config.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }

    for peer in &config.peers {
        output.push_str("\n[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key);
        if !peer.allowed_ips.is_empty() {
            let _ = writeln!(output, "AllowedIPs = {}", peer.joined_allowed_ips());
        }
        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }
    }

    output
}
