//! In-process topology store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::record::{NodeRole, PeerRecord};
use crate::store::{ChangeEvent, ChangeKind, TopologyStore, WatchFilter, WATCH_BUFFER};

type CollectionKey = (NodeRole, String);

struct Watcher {
    role: NodeRole,
    namespace: String,
    filter: WatchFilter,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<CollectionKey, BTreeMap<String, PeerRecord>>,
    watchers: Vec<Watcher>,
    outage: Option<String>,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        match &self.outage {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn publish(&mut self, event: &ChangeEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if watcher.role != event.role
                || watcher.namespace != event.namespace
                || !watcher.filter.matches(&event.name)
            {
                continue;
            }
            // A full channel already holds a pending "look again".
            if watcher.tx.try_send(event.clone()).is_err() {
                trace!(%event, "watch channel full, dropping event");
            }
        }
    }
}

/// A topology store held entirely in memory.
///
/// Cloning yields another handle to the same data. Used for embedding the
/// agent and in tests, where [`MemoryStore::set_outage`] simulates a
/// temporarily unreachable control plane.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record and notifies watchers.
    pub fn put(&self, namespace: &str, record: PeerRecord) {
        let event = ChangeEvent {
            role: record.role(),
            namespace: namespace.to_string(),
            name: record.name.clone(),
            kind: ChangeKind::Upserted,
        };
        let mut inner = self.inner.write();
        inner
            .collections
            .entry((record.role(), namespace.to_string()))
            .or_default()
            .insert(record.name.clone(), record);
        debug!(%event, "record stored");
        inner.publish(&event);
    }

    /// Removes a record, returning it if it existed.
    pub fn remove(&self, role: NodeRole, namespace: &str, name: &str) -> Option<PeerRecord> {
        let mut inner = self.inner.write();
        let removed = inner
            .collections
            .get_mut(&(role, namespace.to_string()))
            .and_then(|c| c.remove(name));
        if removed.is_some() {
            let event = ChangeEvent {
                role,
                namespace: namespace.to_string(),
                name: name.to_string(),
                kind: ChangeKind::Deleted,
            };
            debug!(%event, "record removed");
            inner.publish(&event);
        }
        removed
    }

    /// Makes every read fail with [`StoreError::Unavailable`] until cleared
    /// with `None`.
    pub fn set_outage(&self, reason: Option<&str>) {
        self.inner.write().outage = reason.map(str::to_string);
    }

    /// Returns the number of live watchers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.write();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }
}

impl TopologyStore for MemoryStore {
    async fn get(&self, role: NodeRole, namespace: &str, name: &str) -> Result<Option<PeerRecord>> {
        let inner = self.inner.read();
        inner.check_available()?;
        Ok(inner
            .collections
            .get(&(role, namespace.to_string()))
            .and_then(|c| c.get(name))
            .cloned())
    }

    async fn list(&self, role: NodeRole, namespace: &str) -> Result<Vec<PeerRecord>> {
        let inner = self.inner.read();
        inner.check_available()?;
        Ok(inner
            .collections
            .get(&(role, namespace.to_string()))
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    fn watch(
        &self,
        role: NodeRole,
        namespace: &str,
        filter: WatchFilter,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.inner.write().watchers.push(Watcher {
            role,
            namespace: namespace.to_string(),
            filter,
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> PeerRecord {
        PeerRecord::server(name, "key", "10.100.1.1", "35.12.23.34:555")
    }

    #[tokio::test]
    async fn get_returns_stored_record() {
        let store = MemoryStore::new();
        store.put("default", server("server1"));

        let found = store
            .get(NodeRole::Server, "default", "server1")
            .await
            .expect("get");
        assert_eq!(found.map(|r| r.name), Some("server1".to_string()));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = MemoryStore::new();
        store.put("default", server("server1"));

        let found = store
            .get(NodeRole::Client, "default", "server1")
            .await
            .expect("get");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn list_is_sorted_and_scoped_by_namespace() {
        let store = MemoryStore::new();
        store.put("default", server("server2"));
        store.put("default", server("server1"));
        store.put("other", server("server0"));

        let names: Vec<String> = store
            .list(NodeRole::Server, "default")
            .await
            .expect("list")
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["server1", "server2"]);
    }

    #[tokio::test]
    async fn outage_fails_reads() {
        let store = MemoryStore::new();
        store.set_outage(Some("control plane down"));

        let err = store
            .list(NodeRole::Server, "default")
            .await
            .expect_err("outage");
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_outage(None);
        assert!(store.list(NodeRole::Server, "default").await.is_ok());
    }

    #[tokio::test]
    async fn watch_respects_role_and_filter() {
        let store = MemoryStore::new();
        let mut named = store
            .watch(
                NodeRole::Client,
                "default",
                WatchFilter::Named("client-cl1".to_string()),
            )
            .expect("watch");
        let mut servers = store
            .watch(NodeRole::Server, "default", WatchFilter::Any)
            .expect("watch");

        store.put("default", PeerRecord::client("client-cl2", "k", "10.100.0.2"));
        store.put("default", PeerRecord::client("client-cl1", "k", "10.100.0.1"));
        store.put("default", server("server1"));

        let event = named.try_recv().expect("named event");
        assert_eq!(event.name, "client-cl1");
        assert!(named.try_recv().is_err());

        let event = servers.try_recv().expect("server event");
        assert_eq!(event.name, "server1");
        assert_eq!(event.kind, ChangeKind::Upserted);
    }

    #[tokio::test]
    async fn remove_emits_delete() {
        let store = MemoryStore::new();
        store.put("default", server("server1"));
        let mut rx = store
            .watch(NodeRole::Server, "default", WatchFilter::Any)
            .expect("watch");

        assert!(store.remove(NodeRole::Server, "default", "server1").is_some());
        assert!(store.remove(NodeRole::Server, "default", "server1").is_none());

        let event = rx.try_recv().expect("delete event");
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_watchers_are_pruned() {
        let store = MemoryStore::new();
        let rx = store
            .watch(NodeRole::Server, "default", WatchFilter::Any)
            .expect("watch");
        assert_eq!(store.watcher_count(), 1);

        drop(rx);
        store.put("default", server("server1"));
        assert_eq!(store.watcher_count(), 0);
    }
}
