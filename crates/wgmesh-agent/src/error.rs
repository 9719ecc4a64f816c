//! Error types for the wgmesh agent.

use std::path::PathBuf;

use thiserror::Error;
use wgmesh_topology::{NodeRole, StoreError};
use wgmesh_wireguard::{BuildError, SyncError, WireGuardError};

/// Errors that can end a synchronization pass or agent startup.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A topology record failed validation; the host was not touched.
    #[error("invalid mesh configuration: {0}")]
    Validation(#[from] BuildError),

    /// This node's own record is missing from the store.
    #[error("{role} record {namespace}/{name} not found")]
    Lookup {
        /// Collection searched.
        role: NodeRole,
        /// Namespace searched.
        namespace: String,
        /// Node name looked up.
        name: String,
    },

    /// Applying the configuration to the kernel failed part way.
    #[error("kernel apply failed: {0}")]
    KernelApply(#[from] SyncError),

    /// The topology store could not be read.
    #[error("topology store error: {0}")]
    TransientStore(#[from] StoreError),

    /// The private key file could not be read or decoded.
    #[error("private key unavailable: {0}")]
    PrivateKey(#[source] WireGuardError),

    /// The rendered configuration could not be written out.
    #[error("cannot persist config to {path}: {source}")]
    Persist {
        /// Destination file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Agent configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Short label for the failing stage, used as a log field.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Validation(_) => "build",
            Self::Lookup { .. } => "lookup",
            Self::KernelApply(e) => match e.step {
                wgmesh_wireguard::SyncStep::Link => "apply:link",
                wgmesh_wireguard::SyncStep::Device => "apply:device",
                wgmesh_wireguard::SyncStep::Addresses => "apply:addresses",
                wgmesh_wireguard::SyncStep::Routes => "apply:routes",
            },
            Self::TransientStore(StoreError::Decode { .. }) => "decode",
            Self::TransientStore(_) => "fetch",
            Self::PrivateKey(_) => "key",
            Self::Persist { .. } => "persist",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_wireguard::SyncStep;

    #[test]
    fn test_lookup_error_display() {
        let err = AgentError::Lookup {
            role: NodeRole::Client,
            namespace: "default".to_string(),
            name: "client-cl1".to_string(),
        };
        assert_eq!(err.to_string(), "client record default/client-cl1 not found");
        assert_eq!(err.stage(), "lookup");
    }

    #[test]
    fn test_kernel_apply_error_names_step() {
        let err = AgentError::from(SyncError {
            step: SyncStep::Routes,
            link: "wg0".to_string(),
            source: WireGuardError::Host("boom".to_string()),
        });
        assert_eq!(
            err.to_string(),
            "kernel apply failed: routes sync failed on wg0: host operation failed: boom"
        );
        assert_eq!(err.stage(), "apply:routes");
    }

    #[test]
    fn test_store_error_converts() {
        let err = AgentError::from(StoreError::Unavailable("etcd down".to_string()));
        assert_eq!(err.to_string(), "topology store error: store unavailable: etcd down");
        assert_eq!(err.stage(), "fetch");
    }

    #[test]
    fn test_decode_error_has_own_stage() {
        let err = AgentError::from(StoreError::Decode {
            path: PathBuf::from("/var/lib/wgmesh/default/servers/server1.json"),
            reason: "missing field `publicKey`".to_string(),
        });
        assert_eq!(err.stage(), "decode");
        assert!(err.to_string().contains("server1.json"));
    }

    #[test]
    fn test_config_error_display() {
        let err = AgentError::Config("interface name too long".to_string());
        assert_eq!(err.to_string(), "configuration error: interface name too long");
    }
}
