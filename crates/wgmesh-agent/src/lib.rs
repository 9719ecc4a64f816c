//! wgmesh node agent.
//!
//! Keeps one local `WireGuard` interface converged with the mesh topology
//! held in the control plane:
//!
//! - [`watch`] turns store change events into notifications
//! - [`reconcile`] debounces them and retries failed passes
//! - [`pass`] fetches the topology, builds the configuration and applies it
//!
//! [`Agent`] wires the three together.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod pass;
pub mod reconcile;
pub mod watch;

pub use config::{AgentArgs, AgentConfig};
pub use error::AgentError;
pub use pass::{desired_config, MeshSync, PassOutcome};
pub use reconcile::{LoopState, Notifier, Reconciler, SyncStatus, SyncTarget};

use tokio::sync::watch as signal;
use tokio::task::JoinHandle;
use tracing::info;
use wgmesh_topology::TopologyStore;
use wgmesh_wireguard::NetworkHost;

/// A fully wired agent for one interface.
pub struct Agent<S, H> {
    reconciler: Reconciler<MeshSync<S, H>>,
    notifier: Notifier,
    watches: Vec<JoinHandle<()>>,
}

impl<S, H> Agent<S, H>
where
    S: TopologyStore + 'static,
    H: NetworkHost + 'static,
{
    /// Opens the store watches for `config` and prepares the loop.
    ///
    /// Must be called inside a tokio runtime; the watch forwarders are
    /// spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::TransientStore`] if a watch cannot be opened.
    pub fn new(config: AgentConfig, store: S, host: H) -> Result<Self, AgentError> {
        let debounce = config.debounce;
        let retry = config.retry_interval;
        let role = config.role;
        let namespace = config.namespace.clone();
        let node_name = config.node_name.clone();

        let span = tracing::info_span!(
            "agent",
            node = %config.node_name,
            iface = %config.interface,
            role = %config.role,
        );
        let target = MeshSync::new(store, host, config);
        let (reconciler, notifier) = Reconciler::new(target, debounce, retry);
        let reconciler = reconciler.with_span(span);

        let watches = watch::forward_changes(
            reconciler.target().store(),
            role,
            &namespace,
            &node_name,
            &notifier,
        )?;

        Ok(Self {
            reconciler,
            notifier,
            watches,
        })
    }

    /// Subscribes to loop status updates.
    pub fn status(&self) -> signal::Receiver<SyncStatus> {
        self.reconciler.status()
    }

    /// Returns a handle that can request extra passes.
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Runs an initial pass, then keeps the interface converged until
    /// `shutdown` becomes true or its sender is dropped.
    pub async fn run(self, shutdown: signal::Receiver<bool>) {
        let Self {
            reconciler,
            notifier,
            watches,
        } = self;

        info!(watches = watches.len(), "agent starting");
        notifier.notify();
        drop(reconciler.run(shutdown).await);

        for task in watches {
            task.abort();
        }
        info!("agent stopped");
    }
}
