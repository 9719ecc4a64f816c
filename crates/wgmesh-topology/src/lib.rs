//! Mesh topology model and control-plane store access for wgmesh.
//!
//! The control plane holds one [`PeerRecord`] per mesh member, grouped by
//! [`NodeRole`] and namespace. The agent only ever reads records through the
//! [`TopologyStore`] trait and subscribes to change notifications; it never
//! writes back.

#![forbid(unsafe_code)]

pub mod directory;
pub mod error;
pub mod memory;
pub mod record;
pub mod store;

pub use directory::DirectoryStore;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use record::{NodeRole, PeerKind, PeerRecord};
pub use store::{ChangeEvent, ChangeKind, TopologyStore, WatchFilter, WATCH_BUFFER};
