//! One synchronization pass: fetch, build, log, apply, persist.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, Instrument, Span};
use wgmesh_topology::{NodeRole, PeerRecord, TopologyStore};
use wgmesh_wireguard::{
    build_interface_config, redact_config, render_config, resolve_record, HostSynchronizer,
    InterfaceConfig, NetworkHost, PrivateKey, SyncReport,
};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::reconcile::SyncTarget;

/// Result of a pass that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Dry run: the configuration was built and logged only.
    DryRun,
    /// The host was converged.
    Applied(SyncReport),
}

/// Reads the topology and the private key and builds this node's desired
/// interface configuration.
///
/// # Errors
///
/// Returns [`AgentError::Lookup`] if this node has no record,
/// [`AgentError::TransientStore`] if the store cannot be read,
/// [`AgentError::PrivateKey`] if the key file is unusable and
/// [`AgentError::Validation`] if any record is malformed or a server endpoint
/// does not resolve.
pub async fn desired_config<S: TopologyStore>(
    store: &S,
    config: &AgentConfig,
) -> Result<InterfaceConfig, AgentError> {
    let me = store
        .get(config.role, &config.namespace, &config.node_name)
        .await?
        .ok_or_else(|| AgentError::Lookup {
            role: config.role,
            namespace: config.namespace.clone(),
            name: config.node_name.clone(),
        })?;

    let mut records: Vec<PeerRecord> = store.list(NodeRole::Server, &config.namespace).await?;
    if config.role == NodeRole::Server {
        records.extend(store.list(NodeRole::Client, &config.namespace).await?);
    }
    debug!(records = records.len(), "fetched topology");

    let me = if config.role == NodeRole::Server {
        resolve_record(&me).await?
    } else {
        me
    };
    let mut resolved = Vec::with_capacity(records.len());
    for record in records.iter().filter(|record| record.name != me.name) {
        resolved.push(resolve_record(record).await?);
    }

    let private_key = PrivateKey::load(&config.private_key_file)
        .await
        .map_err(AgentError::PrivateKey)?;

    Ok(build_interface_config(
        &me,
        config.role,
        &resolved,
        private_key,
        config.routing,
    )?)
}

/// Synchronizes one interface from a topology store.
#[derive(Debug)]
pub struct MeshSync<S, H> {
    store: S,
    sync: HostSynchronizer<H>,
    config: AgentConfig,
    span: Span,
}

impl<S: TopologyStore, H: NetworkHost> MeshSync<S, H> {
    /// Creates a pass runner for `config`.
    pub fn new(store: S, host: H, config: AgentConfig) -> Self {
        let span = tracing::info_span!(
            "mesh_sync",
            node = %config.node_name,
            iface = %config.interface,
            role = %config.role,
        );
        Self {
            store,
            sync: HostSynchronizer::with_span(host, span.clone()),
            config,
            span,
        }
    }

    /// Returns the store passes read from.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the configuration this runner was built with.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// Returns the first error from fetching, building, applying or
    /// persisting. A build failure never reaches the host.
    pub async fn run_pass(&self) -> Result<PassOutcome, AgentError> {
        async {
            let desired = desired_config(&self.store, &self.config).await?;
            info!(
                public_key = %desired.public_key(),
                peers = desired.peers.len(),
                "desired configuration built"
            );
            info!(config = %redact_config(&desired), "rendered configuration");

            if self.config.dry_run {
                info!("dry run, skipping apply");
                return Ok(PassOutcome::DryRun);
            }

            let report = self.sync.apply(&self.config.interface, &desired).await?;

            if let Some(path) = self.config.sync_config_path() {
                persist(&path, &render_config(&desired)).await?;
                debug!(path = %path.display(), "configuration persisted");
            }
            Ok::<_, AgentError>(PassOutcome::Applied(report))
        }
        .instrument(self.span.clone())
        .await
    }
}

impl<S: TopologyStore, H: NetworkHost> SyncTarget for MeshSync<S, H> {
    async fn sync(&mut self) -> Result<(), AgentError> {
        self.run_pass().await.map(drop)
    }
}

/// Writes `contents` to `path` with mode 0600, replacing it atomically.
async fn persist(path: &Path, contents: &str) -> Result<(), AgentError> {
    let err = |source| AgentError::Persist {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(err)?;
    }

    let tmp = path.with_extension("conf.tmp");
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await.map_err(err)?;
    file.write_all(contents.as_bytes()).await.map_err(err)?;
    file.sync_all().await.map_err(err)?;
    drop(file);

    tokio::fs::rename(&tmp, path).await.map_err(err)
}
