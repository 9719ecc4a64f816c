//! `WireGuard` configuration and host convergence for wgmesh.
//!
//! This crate turns mesh topology records into a [`InterfaceConfig`]
//! ([`build_interface_config`]), renders it ([`render_config`],
//! [`redact_config`]) and converges a host to it ([`HostSynchronizer`]) over
//! the [`NetworkHost`] capability.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod host;
mod keys;
pub mod linux;
pub mod mesh;
pub mod sync;
pub mod types;

pub use config::{
    redact_config, render_config, render_device_config, InterfaceConfig, PeerConfig, MIN_MTU,
};
pub use error::{BuildError, Result, SyncError, SyncStep, WireGuardError};
pub use host::{FakeNetworkHost, Fault, HostOp, HostOpKind, NetworkHost, Route};
pub use keys::{PrivateKey, PublicKey, KEY_SIZE};
pub use linux::IpCommandHost;
pub use mesh::{build_interface_config, resolve_record};
pub use sync::{HostSynchronizer, SyncReport};
pub use types::{AllowedIp, Endpoint, RoutePolicy};
