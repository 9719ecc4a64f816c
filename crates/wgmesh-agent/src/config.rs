//! Agent configuration.
//!
//! [`AgentArgs`] is the command line surface (every flag also reads a
//! `WGMESH_*` environment variable); [`AgentConfig`] is the validated form
//! the rest of the agent works with.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use wgmesh_topology::NodeRole;
use wgmesh_wireguard::RoutePolicy;

use crate::error::AgentError;

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_INTERFACE_NAME: usize = 15;

/// Command line arguments shared by `run` and `render`.
#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
    /// Role of this node in the mesh.
    #[arg(long, env = "WGMESH_ROLE", default_value = "client")]
    pub role: NodeRole,

    /// Name of this node's record (defaults to the system hostname).
    #[arg(long, env = "WGMESH_NODE_NAME")]
    pub node_name: Option<String>,

    /// Mesh interface to manage.
    #[arg(long, env = "WGMESH_INTERFACE", default_value = "wg0")]
    pub interface: String,

    /// File holding the base64 private key.
    #[arg(long, env = "WGMESH_PRIVATE_KEY_FILE", default_value = "/etc/wireguard/wg0.key")]
    pub private_key_file: PathBuf,

    /// Topology namespace.
    #[arg(long, env = "WGMESH_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Root directory of the topology store.
    #[arg(long, env = "WGMESH_STORE_DIR", default_value = "/var/lib/wgmesh/topology")]
    pub store_dir: PathBuf,

    /// How often the store directory is polled for changes.
    #[arg(long, env = "WGMESH_STORE_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub store_poll_interval_ms: u64,

    /// Log the desired configuration without touching the host.
    #[arg(long, env = "WGMESH_DRY_RUN")]
    pub dry_run: bool,

    /// Directory to write `<interface>.conf` into after each successful apply.
    #[arg(long, env = "WGMESH_SYNC_CONFIG_DIR")]
    pub sync_config_dir: Option<PathBuf>,

    /// Metric for installed routes.
    #[arg(long, env = "WGMESH_ROUTE_METRIC")]
    pub route_metric: Option<u32>,

    /// Protocol tag for installed routes.
    #[arg(long, env = "WGMESH_ROUTE_PROTOCOL")]
    pub route_protocol: Option<u8>,

    /// Routing table for installed routes.
    #[arg(long, env = "WGMESH_ROUTE_TABLE")]
    pub route_table: Option<u32>,

    /// Quiet period after a change notification before a pass runs.
    #[arg(long, env = "WGMESH_DEBOUNCE_MS", default_value_t = 200)]
    pub debounce_ms: u64,

    /// Interval between retries while out of sync.
    #[arg(long, env = "WGMESH_RETRY_INTERVAL_MS", default_value_t = 5000)]
    pub retry_interval_ms: u64,
}

impl AgentArgs {
    /// Validates the arguments. `hostname` is used when no node name was
    /// given.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] describing the first invalid value.
    pub fn into_config(self, hostname: Option<String>) -> Result<AgentConfig, AgentError> {
        let node_name = self
            .node_name
            .or(hostname)
            .ok_or_else(|| AgentError::Config("node name is not set".to_string()))?;

        let config = AgentConfig {
            role: self.role,
            node_name,
            interface: self.interface,
            private_key_file: self.private_key_file,
            namespace: self.namespace,
            store_dir: self.store_dir,
            store_poll_interval: Duration::from_millis(self.store_poll_interval_ms),
            dry_run: self.dry_run,
            sync_config_dir: self.sync_config_dir,
            routing: RoutePolicy {
                metric: self.route_metric,
                protocol: self.route_protocol,
                table: self.route_table,
            },
            debounce: Duration::from_millis(self.debounce_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validated agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Role of this node.
    pub role: NodeRole,
    /// Name of this node's record.
    pub node_name: String,
    /// Interface to manage.
    pub interface: String,
    /// Private key file, read on every pass.
    pub private_key_file: PathBuf,
    /// Topology namespace.
    pub namespace: String,
    /// Root of the directory store.
    pub store_dir: PathBuf,
    /// Store polling period.
    pub store_poll_interval: Duration,
    /// Skip apply and persistence.
    pub dry_run: bool,
    /// Where to persist the rendered configuration.
    pub sync_config_dir: Option<PathBuf>,
    /// Attributes for installed routes.
    pub routing: RoutePolicy,
    /// Debounce window.
    pub debounce: Duration,
    /// Retry interval while dirty.
    pub retry_interval: Duration,
}

impl AgentConfig {
    /// Creates a configuration with default settings for `node_name`.
    #[must_use]
    pub fn new(role: NodeRole, node_name: impl Into<String>) -> Self {
        Self {
            role,
            node_name: node_name.into(),
            interface: "wg0".to_string(),
            private_key_file: PathBuf::from("/etc/wireguard/wg0.key"),
            namespace: "default".to_string(),
            store_dir: PathBuf::from("/var/lib/wgmesh/topology"),
            store_poll_interval: Duration::from_secs(1),
            dry_run: false,
            sync_config_dir: None,
            routing: RoutePolicy::default(),
            debounce: Duration::from_millis(200),
            retry_interval: Duration::from_secs(5),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.node_name.trim().is_empty() {
            return Err(AgentError::Config("node name cannot be empty".to_string()));
        }

        validate_interface_name(&self.interface)?;

        if self.namespace.is_empty() {
            return Err(AgentError::Config("namespace cannot be empty".to_string()));
        }

        for (name, value) in [
            ("store poll interval", self.store_poll_interval),
            ("debounce", self.debounce),
            ("retry interval", self.retry_interval),
        ] {
            if value.is_zero() {
                return Err(AgentError::Config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }

    /// Path of the persisted configuration, if persistence is enabled.
    #[must_use]
    pub fn sync_config_path(&self) -> Option<PathBuf> {
        self.sync_config_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.conf", self.interface)))
    }
}

fn validate_interface_name(name: &str) -> Result<(), AgentError> {
    if name.is_empty() || name.len() > MAX_INTERFACE_NAME {
        return Err(AgentError::Config(format!(
            "interface name {name:?} must be 1-{MAX_INTERFACE_NAME} bytes"
        )));
    }
    if name == "." || name == ".." {
        return Err(AgentError::Config(format!("interface name {name:?} is reserved")));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(AgentError::Config(format!(
            "interface name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use test_case::test_case;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: AgentArgs,
    }

    fn parse(argv: &[&str]) -> AgentArgs {
        let mut full = vec!["wgmesh-agent"];
        full.extend_from_slice(argv);
        TestCli::try_parse_from(full).expect("valid arguments").args
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&["--node-name", "client-cl1"])
            .into_config(None)
            .expect("valid config");
        assert_eq!(config, AgentConfig::new(NodeRole::Client, "client-cl1"));
        assert_eq!(config.sync_config_path(), None);
    }

    #[test]
    fn hostname_is_the_fallback_name() {
        let config = parse(&[])
            .into_config(Some("node-7".to_string()))
            .expect("valid config");
        assert_eq!(config.node_name, "node-7");
    }

    #[test]
    fn explicit_name_wins_over_hostname() {
        let config = parse(&["--node-name", "server1"])
            .into_config(Some("node-7".to_string()))
            .expect("valid config");
        assert_eq!(config.node_name, "server1");
    }

    #[test]
    fn missing_name_is_rejected() {
        let err = parse(&[]).into_config(None).expect_err("no name");
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn flags_are_parsed() {
        let config = parse(&[
            "--role",
            "server",
            "--node-name",
            "server1",
            "--interface",
            "mesh0",
            "--route-metric",
            "100",
            "--route-protocol",
            "42",
            "--route-table",
            "200",
            "--sync-config-dir",
            "/run/wgmesh",
            "--dry-run",
            "--debounce-ms",
            "50",
        ])
        .into_config(None)
        .expect("valid config");

        assert_eq!(config.role, NodeRole::Server);
        assert!(config.dry_run);
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(
            config.routing,
            RoutePolicy {
                metric: Some(100),
                protocol: Some(42),
                table: Some(200),
            }
        );
        assert_eq!(
            config.sync_config_path(),
            Some(PathBuf::from("/run/wgmesh/mesh0.conf"))
        );
    }

    #[test]
    fn unknown_role_is_a_parse_error() {
        let result = TestCli::try_parse_from(["wgmesh-agent", "--role", "hub"]);
        assert!(result.is_err());
    }

    #[test_case("" ; "empty")]
    #[test_case("wireguard-mesh-0" ; "sixteen bytes")]
    #[test_case("wg/0" ; "slash")]
    #[test_case("wg 0" ; "space")]
    #[test_case(".." ; "dotdot")]
    fn invalid_interface_names(name: &str) {
        let mut config = AgentConfig::new(NodeRole::Client, "client-cl1");
        config.interface = name.to_string();
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test_case("--debounce-ms" ; "debounce")]
    #[test_case("--retry-interval-ms" ; "retry")]
    #[test_case("--store-poll-interval-ms" ; "poll")]
    fn zero_intervals_rejected(flag: &str) {
        let err = parse(&["--node-name", "n", flag, "0"])
            .into_config(None)
            .expect_err("zero interval");
        assert!(err.to_string().contains("must be non-zero"));
    }
}
