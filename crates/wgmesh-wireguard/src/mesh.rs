//! Mesh configuration builder.
//!
//! Turns control-plane [`PeerRecord`]s into a validated [`InterfaceConfig`].
//! Servers peer with every other server and every client; clients peer with
//! servers only.

use tracing::debug;
use wgmesh_topology::{NodeRole, PeerKind, PeerRecord};

use crate::config::{InterfaceConfig, PeerConfig, MIN_MTU};
use crate::error::BuildError;
use crate::keys::{PrivateKey, PublicKey};
use crate::types::{AllowedIp, Endpoint, RoutePolicy};

/// Builds the interface configuration for `me` acting as `role`.
///
/// `records` holds every known mesh member; `me` may appear among them and is
/// skipped by name. Peers come out servers first, then clients (servers
/// only), each group in the order supplied.
///
/// # Errors
///
/// Returns a [`BuildError`] naming the first record whose key, address, extra
/// CIDR, MTU or endpoint does not parse. No partial configuration is returned.
pub fn build_interface_config(
    me: &PeerRecord,
    role: NodeRole,
    records: &[PeerRecord],
    private_key: PrivateKey,
    routing: RoutePolicy,
) -> Result<InterfaceConfig, BuildError> {
    let address = parse_address(me)?;
    let mut config = InterfaceConfig::new(private_key, address).with_routing(routing);

    if let Some(mtu) = me.mtu {
        if mtu < MIN_MTU {
            return Err(BuildError::InvalidMtu {
                name: me.name.clone(),
                mtu,
            });
        }
        config = config.with_mtu(mtu);
    }

    if role == NodeRole::Server {
        let endpoint = parse_endpoint(me)?;
        config = config.with_listen_port(endpoint.port());
    }

    let others = || records.iter().filter(|record| record.name != me.name);

    for record in others().filter(|r| r.role() == NodeRole::Server) {
        config = config.with_peer(peer_config(record)?);
    }
    if role == NodeRole::Server {
        for record in others().filter(|r| r.role() == NodeRole::Client) {
            config = config.with_peer(peer_config(record)?);
        }
    }

    debug!(
        node = %me.name,
        role = %role,
        peers = config.peers.len(),
        "built interface config"
    );
    Ok(config)
}

/// Resolves the endpoint of a server record to an IP literal.
///
/// Client records are returned unchanged.
///
/// # Errors
///
/// Returns [`BuildError::InvalidEndpoint`] naming the record when the endpoint
/// is missing, malformed or does not resolve.
pub async fn resolve_record(record: &PeerRecord) -> Result<PeerRecord, BuildError> {
    if record.role() != NodeRole::Server {
        return Ok(record.clone());
    }
    let endpoint = parse_endpoint(record)?;
    let resolved = endpoint
        .resolve()
        .await
        .map_err(|source| BuildError::InvalidEndpoint {
            name: record.name.clone(),
            source,
        })?;
    if resolved != endpoint {
        debug!(record = %record.name, from = %endpoint, to = %resolved, "resolved endpoint");
    }

    let mut record = record.clone();
    record.kind = PeerKind::Server {
        endpoint: resolved.to_string(),
    };
    Ok(record)
}

fn peer_config(record: &PeerRecord) -> Result<PeerConfig, BuildError> {
    let public_key =
        PublicKey::from_base64(&record.public_key).map_err(|source| BuildError::InvalidKey {
            name: record.name.clone(),
            source,
        })?;

    let mut peer = PeerConfig::new(public_key).with_allowed_ip(parse_address(record)?);
    for cidr in &record.extra_allowed_ips {
        let allowed = AllowedIp::from_cidr(cidr).map_err(|source| BuildError::InvalidCidr {
            name: record.name.clone(),
            source,
        })?;
        peer = peer.with_allowed_ip(allowed);
    }

    if let PeerKind::Server { .. } = record.kind {
        peer = peer.with_endpoint(parse_endpoint(record)?);
    }
    Ok(peer)
}

fn parse_address(record: &PeerRecord) -> Result<AllowedIp, BuildError> {
    AllowedIp::from_address(&record.address).map_err(|source| BuildError::InvalidAddress {
        name: record.name.clone(),
        source,
    })
}

fn parse_endpoint(record: &PeerRecord) -> Result<Endpoint, BuildError> {
    let invalid = |source| BuildError::InvalidEndpoint {
        name: record.name.clone(),
        source,
    };
    let text = record.endpoint().ok_or_else(|| {
        invalid(crate::error::WireGuardError::InvalidEndpoint(
            "no endpoint on record".to_string(),
        ))
    })?;
    text.parse::<Endpoint>().map_err(invalid)
}
