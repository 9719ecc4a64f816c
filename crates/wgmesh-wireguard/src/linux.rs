//! Linux [`NetworkHost`] driving iproute2 and `wg`.
//!
//! Links, addresses and routes go through `ip` (JSON output for listings),
//! and the device is configured with `wg setconf <link> /dev/stdin`, so the
//! private key never appears on a command line.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{render_device_config, InterfaceConfig};
use crate::error::{Result, WireGuardError};
use crate::host::{NetworkHost, Route};

/// Default time allowed for a single `ip` or `wg` invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// [`NetworkHost`] backed by the `ip` and `wg` command line tools.
#[derive(Debug, Clone)]
pub struct IpCommandHost {
    ip: String,
    wg: String,
    timeout: Duration,
}

impl Default for IpCommandHost {
    fn default() -> Self {
        Self::new()
    }
}

/// What a failed command was acting on, used to classify its error.
#[derive(Debug, Clone, Copy)]
enum Subject<'a> {
    Link(&'a str),
    Address(&'a str),
    Route(&'a str),
}

impl IpCommandHost {
    /// Creates a host using `ip` and `wg` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ip: "ip".to_string(),
            wg: "wg".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Overrides the tool paths.
    #[must_use]
    pub fn with_tools(mut self, ip: impl Into<String>, wg: impl Into<String>) -> Self {
        self.ip = ip.into();
        self.wg = wg.into();
        self
    }

    /// Overrides the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
        subject: Subject<'_>,
    ) -> Result<String> {
        let command_line = format!("{program} {}", args.join(" "));
        debug!(command = %command_line, "running");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = command.spawn()?;
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| WireGuardError::Command {
                command: command_line.clone(),
                status: format!("timed out after {:?}", self.timeout),
                stderr: String::new(),
            })??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let err = classify(&command_line, &output.status.to_string(), &stderr, subject);
        if matches!(err, WireGuardError::Command { .. }) {
            warn!(command = %command_line, stderr = %stderr, "command failed");
        }
        Err(err)
    }

    async fn ip(&self, args: &[String], subject: Subject<'_>) -> Result<String> {
        self.run(&self.ip, args, None, subject).await
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn classify(command: &str, status: &str, stderr: &str, subject: Subject<'_>) -> WireGuardError {
    let missing_link = stderr.contains("does not exist") || stderr.contains("Cannot find device");
    match subject {
        Subject::Link(name) if stderr.contains("File exists") => {
            WireGuardError::LinkExists(name.to_string())
        }
        Subject::Address(address) if stderr.contains("File exists") => {
            WireGuardError::AddressExists(address.to_string())
        }
        Subject::Address(address) if stderr.contains("Cannot assign requested address") => {
            WireGuardError::AddressNotFound(address.to_string())
        }
        Subject::Route(route) if stderr.contains("File exists") => {
            WireGuardError::RouteExists(route.to_string())
        }
        Subject::Route(route) if stderr.contains("No such process") => {
            WireGuardError::RouteNotFound(route.to_string())
        }
        Subject::Link(name) if missing_link => WireGuardError::LinkNotFound(name.to_string()),
        _ => WireGuardError::Command {
            command: command.to_string(),
            status: status.to_string(),
            stderr: stderr.to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: IpAddr,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    protocol: Option<String>,
}

fn parse_addresses(command: &str, json: &str) -> Result<Vec<IpNet>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let links: Vec<IpLink> =
        serde_json::from_str(json).map_err(|e| WireGuardError::UnexpectedOutput {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
    links
        .iter()
        .flat_map(|link| &link.addr_info)
        .filter(|info| info.family == "inet")
        .map(|info| {
            IpNet::new(info.local, info.prefixlen).map_err(|e| WireGuardError::UnexpectedOutput {
                command: command.to_string(),
                reason: format!("{}/{}: {e}", info.local, info.prefixlen),
            })
        })
        .collect()
}

fn parse_routes(command: &str, json: &str) -> Result<Vec<IpNet>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let routes: Vec<IpRoute> =
        serde_json::from_str(json).map_err(|e| WireGuardError::UnexpectedOutput {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
    let mut destinations = Vec::with_capacity(routes.len());
    for route in routes {
        if route.protocol.as_deref() == Some("kernel") {
            continue;
        }
        let dest = match route.dst.as_str() {
            "default" => "0.0.0.0/0".parse::<IpNet>().ok(),
            dst if dst.contains('/') => dst.parse::<IpNet>().ok(),
            dst => dst.parse::<IpAddr>().ok().map(IpNet::from),
        };
        match dest {
            Some(net) => destinations.push(net.trunc()),
            None => {
                return Err(WireGuardError::UnexpectedOutput {
                    command: command.to_string(),
                    reason: format!("unparseable route destination {:?}", route.dst),
                });
            }
        }
    }
    Ok(destinations)
}

fn mtu_args(link: &str, mtu: u16) -> Vec<String> {
    args(["link", "set", "dev", link, "mtu", &mtu.to_string()])
}

fn route_args(verb: &str, link: &str, route: &Route) -> Vec<String> {
    let mut parts = args(["route", verb, &route.destination.to_string(), "dev", link]);
    if verb == "add" {
        if let Some(metric) = route.metric {
            parts.extend(args(["metric", &metric.to_string()]));
        }
        if let Some(protocol) = route.protocol {
            parts.extend(args(["proto", &protocol.to_string()]));
        }
    }
    if let Some(table) = route.table {
        parts.extend(args(["table", &table.to_string()]));
    }
    parts
}

impl NetworkHost for IpCommandHost {
    async fn link_exists(&self, link: &str) -> Result<bool> {
        match self
            .ip(&args(["link", "show", "dev", link]), Subject::Link(link))
            .await
        {
            Ok(_) => Ok(true),
            Err(WireGuardError::LinkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_link(&self, link: &str) -> Result<()> {
        self.ip(
            &args(["link", "add", "dev", link, "type", "wireguard"]),
            Subject::Link(link),
        )
        .await
        .map(drop)
    }

    async fn set_link_mtu(&self, link: &str, mtu: u16) -> Result<()> {
        self.ip(&mtu_args(link, mtu), Subject::Link(link))
            .await
            .map(drop)
    }

    async fn set_link_up(&self, link: &str) -> Result<()> {
        self.ip(&args(["link", "set", "dev", link, "up"]), Subject::Link(link))
            .await
            .map(drop)
    }

    async fn configure_device(&self, link: &str, config: &InterfaceConfig) -> Result<()> {
        let document = render_device_config(config);
        self.run(
            &self.wg,
            &args(["setconf", link, "/dev/stdin"]),
            Some(&document),
            Subject::Link(link),
        )
        .await
        .map(drop)
    }

    async fn list_addresses(&self, link: &str) -> Result<Vec<IpNet>> {
        let argv = args(["-j", "-4", "addr", "show", "dev", link]);
        let out = self.ip(&argv, Subject::Link(link)).await?;
        parse_addresses(&format!("{} {}", self.ip, argv.join(" ")), &out)
    }

    async fn add_address(&self, link: &str, address: IpNet) -> Result<()> {
        let text = address.to_string();
        self.ip(
            &args(["-4", "addr", "add", &text, "dev", link]),
            Subject::Address(&text),
        )
        .await
        .map(drop)
    }

    async fn remove_address(&self, link: &str, address: IpNet) -> Result<()> {
        let text = address.to_string();
        self.ip(
            &args(["-4", "addr", "del", &text, "dev", link]),
            Subject::Address(&text),
        )
        .await
        .map(drop)
    }

    async fn list_routes(&self, link: &str, table: Option<u32>) -> Result<Vec<IpNet>> {
        let mut argv = args(["-j", "-4", "route", "show", "dev", link]);
        if let Some(table) = table {
            argv.extend(args(["table", &table.to_string()]));
        }
        let out = self.ip(&argv, Subject::Link(link)).await?;
        parse_routes(&format!("{} {}", self.ip, argv.join(" ")), &out)
    }

    async fn add_route(&self, link: &str, route: &Route) -> Result<()> {
        let text = route.to_string();
        self.ip(&route_args("add", link, route), Subject::Route(&text))
            .await
            .map(drop)
    }

    async fn remove_route(&self, link: &str, route: &Route) -> Result<()> {
        let text = route.to_string();
        self.ip(&route_args("del", link, route), Subject::Route(&text))
            .await
            .map(drop)
    }
}
