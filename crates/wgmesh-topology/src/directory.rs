//! File-backed topology store.
//!
//! Records live as JSON documents under
//! `<root>/<namespace>/<servers|clients>/<name>.json`. The record name is the
//! file stem and the role is implied by the directory, so documents only
//! carry the remaining fields:
//!
//! ```json
//! { "publicKey": "qlgn…2Vs=", "address": "10.100.1.1", "endpoint": "35.12.23.34:555" }
//! ```
//!
//! Watches poll the collection directory and diff successive snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::record::{NodeRole, PeerKind, PeerRecord};
use crate::store::{ChangeEvent, ChangeKind, TopologyStore, WatchFilter, WATCH_BUFFER};

const RECORD_EXTENSION: &str = "json";

/// On-disk document shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    public_key: String,
    address: String,
    #[serde(default, rename = "extraAllowedIPs", skip_serializing_if = "Vec::is_empty")]
    extra_allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mtu: Option<u16>,
}

impl StoredRecord {
    fn into_record(self, role: NodeRole, name: String, path: &Path) -> Result<PeerRecord> {
        let kind = match role {
            NodeRole::Server => PeerKind::Server {
                endpoint: self.endpoint.ok_or_else(|| StoreError::Decode {
                    path: path.to_path_buf(),
                    reason: "server record has no endpoint".to_string(),
                })?,
            },
            NodeRole::Client => PeerKind::Client,
        };
        Ok(PeerRecord {
            name,
            public_key: self.public_key,
            address: self.address,
            extra_allowed_ips: self.extra_allowed_ips,
            mtu: self.mtu,
            kind,
        })
    }
}

impl From<&PeerRecord> for StoredRecord {
    fn from(record: &PeerRecord) -> Self {
        Self {
            public_key: record.public_key.clone(),
            address: record.address.clone(),
            extra_allowed_ips: record.extra_allowed_ips.clone(),
            endpoint: record.endpoint().map(str::to_string),
            mtu: record.mtu,
        }
    }
}

/// Raw collection contents keyed by record name.
type Snapshot = BTreeMap<String, Vec<u8>>;

/// A topology store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    poll_interval: Duration,
}

impl DirectoryStore {
    /// Opens a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not an existing directory.
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root).map_err(|e| StoreError::io(&root, e))?;
        if !meta.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            poll_interval,
        })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes a record, replacing any previous version atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are unusable or the write fails.
    pub async fn put(&self, namespace: &str, record: &PeerRecord) -> Result<()> {
        let dir = self.collection_dir(record.role(), namespace)?;
        let path = record_path(&dir, &record.name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let body = serde_json::to_vec_pretty(&StoredRecord::from(record)).map_err(|e| {
            StoreError::Decode {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Deletes a record. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are unusable or the removal fails.
    pub async fn delete(&self, role: NodeRole, namespace: &str, name: &str) -> Result<bool> {
        let path = record_path(&self.collection_dir(role, namespace)?, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn collection_dir(&self, role: NodeRole, namespace: &str) -> Result<PathBuf> {
        validate_name(namespace)?;
        Ok(self.root.join(namespace).join(role.collection()))
    }
}

fn validate_name(name: &str) -> Result<()> {
    let usable = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if usable {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn record_path(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(dir.join(format!("{name}.{RECORD_EXTENSION}")))
}

fn decode(role: NodeRole, name: String, path: &Path, bytes: &[u8]) -> Result<PeerRecord> {
    let stored: StoredRecord = serde_json::from_slice(bytes).map_err(|e| StoreError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    stored.into_record(role, name, path)
}

/// Reads every record document in `dir`. A missing directory is empty.
async fn scan(dir: &Path) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshot),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let name = name.to_string();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                snapshot.insert(name, bytes);
            }
            // Deleted between listing and reading.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
    }
    Ok(snapshot)
}

fn diff(before: &Snapshot, after: &Snapshot) -> Vec<(String, ChangeKind)> {
    let mut changes = Vec::new();
    for (name, bytes) in after {
        if before.get(name) != Some(bytes) {
            changes.push((name.clone(), ChangeKind::Upserted));
        }
    }
    for name in before.keys() {
        if !after.contains_key(name) {
            changes.push((name.clone(), ChangeKind::Deleted));
        }
    }
    changes
}

impl TopologyStore for DirectoryStore {
    async fn get(&self, role: NodeRole, namespace: &str, name: &str) -> Result<Option<PeerRecord>> {
        let path = record_path(&self.collection_dir(role, namespace)?, name)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        decode(role, name.to_string(), &path, &bytes).map(Some)
    }

    async fn list(&self, role: NodeRole, namespace: &str) -> Result<Vec<PeerRecord>> {
        let dir = self.collection_dir(role, namespace)?;
        let snapshot = scan(&dir).await?;
        snapshot
            .into_iter()
            .map(|(name, bytes)| {
                let path = dir.join(format!("{name}.{RECORD_EXTENSION}"));
                decode(role, name, &path, &bytes)
            })
            .collect()
    }

    fn watch(
        &self,
        role: NodeRole,
        namespace: &str,
        filter: WatchFilter,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        let dir = self.collection_dir(role, namespace)?;
        let namespace = namespace.to_string();
        let poll_interval = self.poll_interval;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        tokio::spawn(async move {
            let mut previous = match scan(&dir).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "initial scan failed");
                    Snapshot::new()
                }
            };
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let current = match scan(&dir).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "scan failed");
                        continue;
                    }
                };
                for (name, kind) in diff(&previous, &current) {
                    if !filter.matches(&name) {
                        continue;
                    }
                    let event = ChangeEvent {
                        role,
                        namespace: namespace.clone(),
                        name,
                        kind,
                    };
                    debug!(%event, "directory change");
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }
        });

        Ok(rx)
    }
}
