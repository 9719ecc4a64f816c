//! Integration tests for the Agent wiring.

use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use wgmesh_agent::{Agent, AgentConfig, LoopState, Notifier, SyncStatus};
use wgmesh_topology::{MemoryStore, NodeRole, PeerRecord};
use wgmesh_wireguard::{FakeNetworkHost, PrivateKey, Route, RoutePolicy};

const PRIVATE: &str = "QBNloaEPjZd/nafQcH55kdYqnQ6YB6gX35l//QGra2E=";
const CLIENT_KEY: &str = "rh3vMGPqe6UhQwly7kZKYAvG4tJa7+j5lOPICXI/1kI=";
const SERVER_KEY: &str = "qlgnbDFeqmA/qbxbtol4mYB0Eq/rDNfJA7Wg97mJ2Vs=";
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    dir: tempfile::TempDir,
    store: MemoryStore,
    host: FakeNetworkHost,
    config: AgentConfig,
}

impl Harness {
    fn new(role: NodeRole, name: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("wg0.key");
        std::fs::write(&key_path, PRIVATE).expect("write key");

        let mut config = AgentConfig::new(role, name);
        config.private_key_file = key_path;
        config.sync_config_dir = Some(dir.path().join("out"));
        config.debounce = Duration::from_millis(20);
        config.retry_interval = Duration::from_millis(100);

        let store = MemoryStore::new();
        store.put("default", PeerRecord::client("client-cl1", CLIENT_KEY, "10.100.0.1"));
        store.put(
            "default",
            PeerRecord::server("server1", SERVER_KEY, "10.100.1.1", "35.12.23.34:555"),
        );

        Self {
            dir,
            store,
            host: FakeNetworkHost::new(),
            config,
        }
    }

    fn start(&self) -> Running {
        let agent = Agent::new(self.config.clone(), self.store.clone(), self.host.clone())
            .expect("agent wiring");
        let status = agent.status();
        let notifier = agent.notifier();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(shutdown_rx));
        Running {
            status,
            notifier,
            shutdown,
            handle,
        }
    }
}

struct Running {
    status: watch::Receiver<SyncStatus>,
    notifier: Notifier,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Running {
    async fn wait_for(&mut self, pred: impl FnMut(&SyncStatus) -> bool) -> SyncStatus {
        let snapshot = tokio::time::timeout(WAIT, self.status.wait_for(pred))
            .await
            .expect("timed out waiting for status")
            .expect("loop alive");
        SyncStatus::clone(&snapshot)
    }

    async fn stop(self) {
        self.shutdown.send(true).expect("agent alive");
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("agent stops")
            .expect("agent task");
    }
}

fn net(s: &str) -> IpNet {
    s.parse().expect("network")
}

async fn route_strings(host: &FakeNetworkHost) -> Vec<String> {
    let mut routes: Vec<String> = host
        .routes("wg0")
        .await
        .iter()
        .map(|r| r.destination.to_string())
        .collect();
    routes.sort();
    routes
}

fn other_key() -> String {
    PrivateKey::generate().public_key().to_base64()
}

#[tokio::test]
async fn test_client_converges_on_start() {
    let harness = Harness::new(NodeRole::Client, "client-cl1");
    let mut running = harness.start();

    let status = running.wait_for(|s| s.passes >= 1).await;
    assert!(!status.dirty);
    assert_eq!(status.state, LoopState::Idle);

    assert!(harness.host.is_up("wg0").await);
    assert_eq!(harness.host.addresses("wg0").await, vec![net("10.100.0.1/32")]);
    assert_eq!(route_strings(&harness.host).await, vec!["10.100.1.1/32"]);

    let device = harness.host.device("wg0").await.expect("device configured");
    assert_eq!(device.peers.len(), 1);
    assert_eq!(device.peers[0].public_key.to_base64(), SERVER_KEY);

    let persisted = harness.dir.path().join("out").join("wg0.conf");
    let text = std::fs::read_to_string(persisted).expect("persisted config");
    assert!(text.contains("Endpoint = 35.12.23.34:555"));

    running.stop().await;
}

#[tokio::test]
async fn test_new_server_triggers_resync() {
    let harness = Harness::new(NodeRole::Client, "client-cl1");
    let mut running = harness.start();
    running.wait_for(|s| s.passes >= 1).await;

    harness.store.put(
        "default",
        PeerRecord::server("server2", &other_key(), "10.100.2.1", "55.12.23.34:123")
            .with_extra_allowed_ip("10.100.3.0/16"),
    );

    let status = running.wait_for(|s| s.passes >= 2).await;
    assert!(!status.dirty);
    assert_eq!(
        route_strings(&harness.host).await,
        vec!["10.100.0.0/16", "10.100.1.1/32", "10.100.2.1/32"]
    );
    let device = harness.host.device("wg0").await.expect("device configured");
    assert_eq!(device.peers.len(), 2);

    running.stop().await;
}

#[tokio::test]
async fn test_other_clients_do_not_wake_a_client() {
    let harness = Harness::new(NodeRole::Client, "client-cl1");
    let mut running = harness.start();
    running.wait_for(|s| s.passes >= 1).await;

    harness
        .store
        .put("default", PeerRecord::client("client-cl2", &other_key(), "10.100.0.2"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(running.status.borrow().passes, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_burst_of_changes_coalesces() {
    let mut harness = Harness::new(NodeRole::Client, "client-cl1");
    harness.config.debounce = Duration::from_millis(200);
    let mut running = harness.start();
    running.wait_for(|s| s.passes >= 1).await;

    for i in 2..7 {
        harness.store.put(
            "default",
            PeerRecord::server(
                format!("server{i}"),
                &other_key(),
                format!("10.100.{i}.1"),
                format!("55.12.23.{i}:123"),
            ),
        );
    }

    running.wait_for(|s| s.passes >= 2).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(running.status.borrow().passes, 2);
    assert_eq!(harness.host.routes("wg0").await.len(), 6);

    running.stop().await;
}

#[tokio::test]
async fn test_store_outage_is_retried() {
    let harness = Harness::new(NodeRole::Client, "client-cl1");
    harness.store.set_outage(Some("leader election"));
    let mut running = harness.start();

    let status = running.wait_for(|s| s.failures >= 1).await;
    assert!(status.dirty);
    assert!(
        status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("leader election"))
    );
    assert!(harness.host.mutations().await.is_empty());

    harness.store.set_outage(None);
    let status = running.wait_for(|s| !s.dirty && s.passes >= 2).await;
    assert_eq!(status.last_error, None);
    assert_eq!(route_strings(&harness.host).await, vec!["10.100.1.1/32"]);

    running.stop().await;
}

#[tokio::test]
async fn test_invalid_record_never_touches_host() {
    let harness = Harness::new(NodeRole::Client, "client-cl1");
    harness.store.put(
        "default",
        PeerRecord::server("server2", "not-a-key", "10.100.2.1", "55.12.23.34:123"),
    );
    let mut running = harness.start();

    let status = running.wait_for(|s| s.failures >= 1).await;
    assert!(status.dirty);
    assert!(harness.host.mutations().await.is_empty());

    harness.store.remove(NodeRole::Server, "default", "server2");
    running.wait_for(|s| !s.dirty).await;
    assert_eq!(route_strings(&harness.host).await, vec!["10.100.1.1/32"]);

    running.stop().await;
}

#[tokio::test]
async fn test_server_replaces_stale_routes() {
    let harness = Harness::new(NodeRole::Server, "server1");
    harness
        .host
        .seed_route("wg0", Route::new(net("10.9.9.0/24"), &RoutePolicy::default()))
        .await;
    let mut running = harness.start();

    let status = running.wait_for(|s| s.passes >= 1).await;
    assert!(!status.dirty);
    assert_eq!(route_strings(&harness.host).await, vec!["10.100.0.1/32"]);
    assert_eq!(harness.host.addresses("wg0").await, vec![net("10.100.1.1/32")]);

    let device = harness.host.device("wg0").await.expect("device configured");
    assert_eq!(device.listen_port, Some(555));
    assert!(device.peers.iter().all(|p| p.endpoint.is_none()));

    running.stop().await;
}

#[tokio::test]
async fn test_dry_run_leaves_host_alone() {
    let mut harness = Harness::new(NodeRole::Client, "client-cl1");
    harness.config.dry_run = true;
    let mut running = harness.start();

    let status = running.wait_for(|s| s.passes >= 1).await;
    assert!(!status.dirty);
    assert!(harness.host.mutations().await.is_empty());
    assert!(!harness.dir.path().join("out").exists());

    running.stop().await;
}

#[tokio::test]
async fn test_notifier_is_closed_after_shutdown() {
    let harness = Harness::new(NodeRole::Client, "client-cl1");
    let mut running = harness.start();
    running.wait_for(|s| s.passes >= 1).await;

    let notifier = running.notifier.clone();
    running.stop().await;
    assert!(!notifier.notify());
}
