//! Store watch wiring.
//!
//! Every change event becomes a bare notification for the reconciliation
//! loop; the pass re-reads full state so event contents do not matter.

use tokio::task::JoinHandle;
use tracing::{debug, Instrument};
use wgmesh_topology::{NodeRole, TopologyStore, WatchFilter};

use crate::error::AgentError;
use crate::reconcile::Notifier;

/// Returns the collections a node of `role` named `node_name` depends on.
///
/// Clients care about their own record and every server; servers care about
/// every client and every server.
#[must_use]
pub fn watch_plan(role: NodeRole, node_name: &str) -> Vec<(NodeRole, WatchFilter)> {
    let own_collection = match role {
        NodeRole::Client => WatchFilter::Named(node_name.to_string()),
        NodeRole::Server => WatchFilter::Any,
    };
    vec![
        (NodeRole::Client, own_collection),
        (NodeRole::Server, WatchFilter::Any),
    ]
}

/// Opens the watches in [`watch_plan`] and forwards their events to
/// `notifier`. The returned tasks end when their watch closes or the loop
/// stops.
///
/// # Errors
///
/// Returns [`AgentError::TransientStore`] if a watch cannot be opened.
pub fn forward_changes<S: TopologyStore>(
    store: &S,
    role: NodeRole,
    namespace: &str,
    node_name: &str,
    notifier: &Notifier,
) -> Result<Vec<JoinHandle<()>>, AgentError> {
    let mut tasks = Vec::new();
    for (collection, filter) in watch_plan(role, node_name) {
        let span = tracing::debug_span!("watch", collection = %collection, filter = ?filter);
        let mut events = store.watch(collection, namespace, filter)?;
        let notifier = notifier.clone();
        tasks.push(tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    debug!(%event, "topology changed");
                    if !notifier.notify() {
                        break;
                    }
                }
                debug!("watch finished");
            }
            .instrument(span),
        ));
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wgmesh_topology::{MemoryStore, PeerRecord};

    #[test]
    fn client_watches_itself_and_servers() {
        assert_eq!(
            watch_plan(NodeRole::Client, "client-cl1"),
            vec![
                (NodeRole::Client, WatchFilter::Named("client-cl1".to_string())),
                (NodeRole::Server, WatchFilter::Any),
            ]
        );
    }

    #[test]
    fn server_watches_everything() {
        assert_eq!(
            watch_plan(NodeRole::Server, "server1"),
            vec![
                (NodeRole::Client, WatchFilter::Any),
                (NodeRole::Server, WatchFilter::Any),
            ]
        );
    }

    #[tokio::test]
    async fn client_ignores_other_clients() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let notifier = Notifier::from_sender(tx);
        let tasks = forward_changes(&store, NodeRole::Client, "default", "client-cl1", &notifier)
            .expect("watch");
        assert_eq!(tasks.len(), 2);

        store.put("default", PeerRecord::client("client-cl2", "k", "10.100.0.2"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        store.put("default", PeerRecord::client("client-cl1", "k", "10.100.0.1"));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(got.expect("notified"), Some(()));

        store.put(
            "default",
            PeerRecord::server("server1", "k", "10.100.1.1", "35.12.23.34:555"),
        );
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(got.expect("notified"), Some(()));

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn other_namespaces_are_ignored() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(8);
        let notifier = Notifier::from_sender(tx);
        let tasks = forward_changes(&store, NodeRole::Server, "default", "server1", &notifier)
            .expect("watch");

        store.put("staging", PeerRecord::client("client-cl1", "k", "10.100.0.1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        for task in tasks {
            task.abort();
        }
    }
}
