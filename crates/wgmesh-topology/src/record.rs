//! Mesh participant records.
//!
//! A [`PeerRecord`] is the declarative description of one mesh member as held
//! by the control plane. Records are read-only for the agent; all parsing of
//! keys, addresses and endpoints happens later when a configuration is built.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role of a node in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Publicly reachable node; meshes with every server and every client.
    Server,
    /// Node without a reachable endpoint; meshes with servers only.
    Client,
}

impl NodeRole {
    /// Returns the lowercase role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }

    /// Returns the collection name used when records are grouped by role.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Server => "servers",
            Self::Client => "clients",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Role-specific part of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum PeerKind {
    /// A server, dialable at `endpoint` (`host:port`).
    Server {
        /// Public `host:port` endpoint.
        endpoint: String,
    },
    /// A client; not directly dialable.
    Client,
}

/// A mesh member as stored in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Unique name within the namespace.
    pub name: String,
    /// Base64-encoded Curve25519 public key.
    pub public_key: String,
    /// Mesh address, with or without a prefix length.
    pub address: String,
    /// Additional CIDRs routed toward this member.
    #[serde(default, rename = "extraAllowedIPs", skip_serializing_if = "Vec::is_empty")]
    pub extra_allowed_ips: Vec<String>,
    /// Interface MTU for this member, kernel default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    /// Role and role-specific fields.
    #[serde(flatten)]
    pub kind: PeerKind,
}

impl PeerRecord {
    /// Creates a server record.
    #[must_use]
    pub fn server(
        name: impl Into<String>,
        public_key: impl Into<String>,
        address: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.into(),
            address: address.into(),
            extra_allowed_ips: Vec::new(),
            mtu: None,
            kind: PeerKind::Server {
                endpoint: endpoint.into(),
            },
        }
    }

    /// Creates a client record.
    #[must_use]
    pub fn client(
        name: impl Into<String>,
        public_key: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.into(),
            address: address.into(),
            extra_allowed_ips: Vec::new(),
            mtu: None,
            kind: PeerKind::Client,
        }
    }

    /// Adds an extra allowed CIDR.
    #[must_use]
    pub fn with_extra_allowed_ip(mut self, cidr: impl Into<String>) -> Self {
        self.extra_allowed_ips.push(cidr.into());
        self
    }

    /// Sets the interface MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Returns the record's role.
    #[must_use]
    pub const fn role(&self) -> NodeRole {
        match self.kind {
            PeerKind::Server { .. } => NodeRole::Server,
            PeerKind::Client => NodeRole::Client,
        }
    }

    /// Returns the endpoint for server records.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match &self.kind {
            PeerKind::Server { endpoint } => Some(endpoint),
            PeerKind::Client => None,
        }
    }
}
