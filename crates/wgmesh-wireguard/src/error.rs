//! Error types for WireGuard configuration and host convergence.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias using [`WireGuardError`].
pub type Result<T> = std::result::Result<T, WireGuardError>;

/// Errors from key handling, value parsing and host operations.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Address is not an IP, with or without prefix.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// CIDR notation could not be parsed.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Endpoint is not a `host:port` pair.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The private key file could not be read.
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        /// Path of the key file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Link does not exist.
    #[error("link not found: {0}")]
    LinkNotFound(String),

    /// Link already exists.
    #[error("link already exists: {0}")]
    LinkExists(String),

    /// Address is already assigned.
    #[error("address already assigned: {0}")]
    AddressExists(String),

    /// Address is not assigned.
    #[error("address not assigned: {0}")]
    AddressNotFound(String),

    /// Route is already installed.
    #[error("route already exists: {0}")]
    RouteExists(String),

    /// Route is not installed.
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// An external tool exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        /// Command line that was run.
        command: String,
        /// Exit status description.
        status: String,
        /// Trimmed standard error.
        stderr: String,
    },

    /// Output of an external tool could not be understood.
    #[error("unexpected output from `{command}`: {reason}")]
    UnexpectedOutput {
        /// Command line that was run.
        command: String,
        /// Parser message.
        reason: String,
    },

    /// Generic host failure.
    #[error("host operation failed: {0}")]
    Host(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort building an interface configuration.
///
/// Every variant names the record that failed validation.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A public key did not decode to 32 bytes.
    #[error("record {name}: {source}")]
    InvalidKey {
        /// Offending record.
        name: String,
        /// Decoding failure.
        #[source]
        source: WireGuardError,
    },

    /// A mesh address did not parse.
    #[error("record {name}: {source}")]
    InvalidAddress {
        /// Offending record.
        name: String,
        /// Parse failure.
        #[source]
        source: WireGuardError,
    },

    /// An extra allowed CIDR did not parse.
    #[error("record {name}: {source}")]
    InvalidCidr {
        /// Offending record.
        name: String,
        /// Parse failure.
        #[source]
        source: WireGuardError,
    },

    /// The requested MTU is below [`MIN_MTU`](crate::config::MIN_MTU).
    #[error("record {name}: MTU {mtu} is below the minimum")]
    InvalidMtu {
        /// Offending record.
        name: String,
        /// Requested MTU.
        mtu: u16,
    },

    /// A server endpoint did not parse, did not resolve or is missing.
    #[error("record {name}: {source}")]
    InvalidEndpoint {
        /// Offending record.
        name: String,
        /// Parse failure.
        #[source]
        source: WireGuardError,
    },
}

impl BuildError {
    /// Returns the name of the record that failed.
    #[must_use]
    pub fn record(&self) -> &str {
        match self {
            Self::InvalidKey { name, .. }
            | Self::InvalidAddress { name, .. }
            | Self::InvalidCidr { name, .. }
            | Self::InvalidMtu { name, .. }
            | Self::InvalidEndpoint { name, .. } => name,
        }
    }
}

/// Step of host synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Ensuring the link exists and is up.
    Link,
    /// Pushing keys and peers to the device.
    Device,
    /// Reconciling interface addresses.
    Addresses,
    /// Reconciling routes.
    Routes,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Link => "link",
            Self::Device => "device",
            Self::Addresses => "addresses",
            Self::Routes => "routes",
        };
        f.write_str(name)
    }
}

/// A host synchronization failure, tagged with the step that failed.
#[derive(Debug, Error)]
#[error("{step} sync failed on {link}: {source}")]
pub struct SyncError {
    /// Step that failed.
    pub step: SyncStep,
    /// Link being synchronized.
    pub link: String,
    /// Host error.
    #[source]
    pub source: WireGuardError,
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(e: base64::DecodeError) -> Self {
        Self::InvalidBase64(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_display() {
        let err = WireGuardError::InvalidKeyLength(16);
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 16");
    }

    #[test]
    fn build_error_names_record() {
        let err = BuildError::InvalidCidr {
            name: "server3".to_string(),
            source: WireGuardError::InvalidCidr("10.0.0.0/33".to_string()),
        };
        assert_eq!(err.record(), "server3");
        assert_eq!(err.to_string(), "record server3: invalid CIDR: 10.0.0.0/33");
    }

    #[test]
    fn sync_error_names_step_and_link() {
        let err = SyncError {
            step: SyncStep::Routes,
            link: "wg0".to_string(),
            source: WireGuardError::Host("boom".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "routes sync failed on wg0: host operation failed: boom"
        );
    }
}
