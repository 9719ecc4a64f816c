//! Control-plane store interface.
//!
//! The agent treats the store as an eventually-consistent, read-only source of
//! [`PeerRecord`]s. Change events carry no payload the agent relies on: every
//! reconciliation pass re-reads full state, so events only say "look again".

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::record::{NodeRole, PeerRecord};

/// Capacity of the channel returned by [`TopologyStore::watch`].
pub const WATCH_BUFFER: usize = 64;

/// Selects which records a watch reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchFilter {
    /// Every record of the watched role.
    Any,
    /// Only the record with this name.
    Named(String),
}

impl WatchFilter {
    /// Returns true if a record named `name` passes the filter.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Named(wanted) => wanted == name,
        }
    }
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or modified.
    Upserted,
    /// Removed.
    Deleted,
}

/// A change notification from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Role collection the record belongs to.
    pub role: NodeRole,
    /// Namespace of the record.
    pub namespace: String,
    /// Record name.
    pub name: String,
    /// Kind of change.
    pub kind: ChangeKind,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            ChangeKind::Upserted => "upserted",
            ChangeKind::Deleted => "deleted",
        };
        write!(f, "{} {}/{} {verb}", self.role, self.namespace, self.name)
    }
}

/// Read access to the mesh topology.
pub trait TopologyStore: Send + Sync {
    /// Fetches one record, `None` if it does not exist.
    fn get(
        &self,
        role: NodeRole,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<PeerRecord>>> + Send;

    /// Lists every record of a role, ordered by name.
    fn list(
        &self,
        role: NodeRole,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<PeerRecord>>> + Send;

    /// Subscribes to changes of a role's records.
    ///
    /// The returned channel closes when the store stops watching.
    fn watch(
        &self,
        role: NodeRole,
        namespace: &str,
        filter: WatchFilter,
    ) -> Result<mpsc::Receiver<ChangeEvent>>;
}
