//! Kernel networking capability.
//!
//! [`NetworkHost`] is the narrow set of link, address and route operations
//! the synchronizer needs. [`IpCommandHost`](crate::linux::IpCommandHost)
//! drives the real kernel; [`FakeNetworkHost`] keeps state in memory and
//! records every mutation for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::RwLock;

use crate::config::InterfaceConfig;
use crate::error::{Result, WireGuardError};
use crate::types::RoutePolicy;

/// A route toward the mesh interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    /// Destination network, host bits cleared.
    pub destination: IpNet,
    /// Route metric.
    pub metric: Option<u32>,
    /// Route protocol tag.
    pub protocol: Option<u8>,
    /// Routing table.
    pub table: Option<u32>,
}

impl Route {
    /// Creates a route to `destination` carrying the policy's attributes.
    #[must_use]
    pub fn new(destination: IpNet, policy: &RoutePolicy) -> Self {
        Self {
            destination: destination.trunc(),
            metric: policy.metric,
            protocol: policy.protocol,
            table: policy.table,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(table) = self.table {
            write!(f, " table {table}")?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}

/// Link, address and route operations on the local host.
///
/// Add operations report an existing entry with the matching `*Exists`
/// error and removals report a missing one with `*NotFound`, so callers can
/// tolerate lost races.
pub trait NetworkHost: Send + Sync {
    /// Returns whether the link exists.
    fn link_exists(&self, link: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Creates a `WireGuard` link.
    fn create_link(&self, link: &str) -> impl Future<Output = Result<()>> + Send;

    /// Sets the link MTU.
    fn set_link_mtu(&self, link: &str, mtu: u16) -> impl Future<Output = Result<()>> + Send;

    /// Sets the link administratively up.
    fn set_link_up(&self, link: &str) -> impl Future<Output = Result<()>> + Send;

    /// Replaces the device's key, listen port and full peer set.
    fn configure_device(
        &self,
        link: &str,
        config: &InterfaceConfig,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Lists IPv4 addresses assigned to the link.
    fn list_addresses(&self, link: &str) -> impl Future<Output = Result<Vec<IpNet>>> + Send;

    /// Assigns an address to the link.
    fn add_address(&self, link: &str, address: IpNet) -> impl Future<Output = Result<()>> + Send;

    /// Removes an address from the link.
    fn remove_address(
        &self,
        link: &str,
        address: IpNet,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Lists destinations of IPv4 routes through the link in `table`
    /// (`None` for the main table). Kernel-generated routes are excluded.
    fn list_routes(
        &self,
        link: &str,
        table: Option<u32>,
    ) -> impl Future<Output = Result<Vec<IpNet>>> + Send;

    /// Installs a route through the link.
    fn add_route(&self, link: &str, route: &Route) -> impl Future<Output = Result<()>> + Send;

    /// Deletes a route through the link.
    fn remove_route(&self, link: &str, route: &Route) -> impl Future<Output = Result<()>> + Send;
}

/// A mutation applied to a [`FakeNetworkHost`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostOp {
    /// Link created.
    CreateLink(String),
    /// Link MTU set.
    SetMtu(String, u16),
    /// Link set up.
    SetLinkUp(String),
    /// Device configured with this many peers.
    ConfigureDevice {
        /// Link name.
        link: String,
        /// Number of peers pushed.
        peers: usize,
    },
    /// Address added.
    AddAddress(String, IpNet),
    /// Address removed.
    RemoveAddress(String, IpNet),
    /// Route added.
    AddRoute(String, Route),
    /// Route removed.
    RemoveRoute(String, Route),
}

impl HostOp {
    /// Returns the operation kind.
    #[must_use]
    pub fn kind(&self) -> HostOpKind {
        match self {
            Self::CreateLink(_) => HostOpKind::CreateLink,
            Self::SetMtu(..) => HostOpKind::SetMtu,
            Self::SetLinkUp(_) => HostOpKind::SetLinkUp,
            Self::ConfigureDevice { .. } => HostOpKind::ConfigureDevice,
            Self::AddAddress(..) => HostOpKind::AddAddress,
            Self::RemoveAddress(..) => HostOpKind::RemoveAddress,
            Self::AddRoute(..) => HostOpKind::AddRoute,
            Self::RemoveRoute(..) => HostOpKind::RemoveRoute,
        }
    }

    /// Returns true for address and route changes.
    #[must_use]
    pub fn is_address_or_route(&self) -> bool {
        matches!(
            self.kind(),
            HostOpKind::AddAddress
                | HostOpKind::RemoveAddress
                | HostOpKind::AddRoute
                | HostOpKind::RemoveRoute
        )
    }
}

/// Operation selector for fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostOpKind {
    /// [`NetworkHost::create_link`].
    CreateLink,
    /// [`NetworkHost::set_link_mtu`].
    SetMtu,
    /// [`NetworkHost::set_link_up`].
    SetLinkUp,
    /// [`NetworkHost::configure_device`].
    ConfigureDevice,
    /// [`NetworkHost::list_addresses`].
    ListAddresses,
    /// [`NetworkHost::add_address`].
    AddAddress,
    /// [`NetworkHost::remove_address`].
    RemoveAddress,
    /// [`NetworkHost::list_routes`].
    ListRoutes,
    /// [`NetworkHost::add_route`].
    AddRoute,
    /// [`NetworkHost::remove_route`].
    RemoveRoute,
}

/// Injected outcome for an operation on a [`FakeNetworkHost`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`WireGuardError::Host`].
    Fail(String),
    /// Report the entry as already present without applying it. A link is
    /// still created, as a concurrent creator would have done.
    AlreadyExists,
    /// Report the entry as missing, without applying.
    NotFound,
}

#[derive(Debug, Default)]
struct FakeLink {
    up: bool,
    mtu: Option<u16>,
    device: Option<InterfaceConfig>,
    addresses: BTreeSet<IpNet>,
    routes: BTreeMap<(Option<u32>, IpNet), Route>,
}

#[derive(Debug, Default)]
struct FakeState {
    links: HashMap<String, FakeLink>,
    mutations: Vec<HostOp>,
    faults: HashMap<HostOpKind, Fault>,
}

impl FakeState {
    fn link_mut(&mut self, name: &str) -> Result<&mut FakeLink> {
        self.links
            .get_mut(name)
            .ok_or_else(|| WireGuardError::LinkNotFound(name.to_string()))
    }

    fn link(&self, name: &str) -> Result<&FakeLink> {
        self.links
            .get(name)
            .ok_or_else(|| WireGuardError::LinkNotFound(name.to_string()))
    }

    fn check(&self, kind: HostOpKind, subject: &str) -> Result<()> {
        let Some(fault) = self.faults.get(&kind) else {
            return Ok(());
        };
        let subject = subject.to_string();
        Err(match (fault, kind) {
            (Fault::Fail(message), _) => WireGuardError::Host(message.clone()),
            (Fault::AlreadyExists, HostOpKind::CreateLink) => WireGuardError::LinkExists(subject),
            (Fault::AlreadyExists, HostOpKind::AddAddress) => {
                WireGuardError::AddressExists(subject)
            }
            (Fault::AlreadyExists, _) => WireGuardError::RouteExists(subject),
            (Fault::NotFound, HostOpKind::RemoveAddress) => {
                WireGuardError::AddressNotFound(subject)
            }
            (Fault::NotFound, HostOpKind::RemoveRoute) => WireGuardError::RouteNotFound(subject),
            (Fault::NotFound, _) => WireGuardError::LinkNotFound(subject),
        })
    }
}

/// In-memory [`NetworkHost`] for tests.
///
/// Clones share state, so a test can keep a handle while the synchronizer
/// owns another.
#[derive(Clone, Debug, Default)]
pub struct FakeNetworkHost {
    state: Arc<RwLock<FakeState>>,
}

impl FakeNetworkHost {
    /// Creates an empty host with no links.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a link directly, bypassing the mutation log.
    pub async fn seed_link(&self, link: &str) {
        self.state
            .write()
            .await
            .links
            .entry(link.to_string())
            .or_default();
    }

    /// Assigns an address directly, creating the link if needed.
    pub async fn seed_address(&self, link: &str, address: IpNet) {
        let mut state = self.state.write().await;
        state
            .links
            .entry(link.to_string())
            .or_default()
            .addresses
            .insert(address);
    }

    /// Installs a route directly, creating the link if needed.
    pub async fn seed_route(&self, link: &str, route: Route) {
        let mut state = self.state.write().await;
        state
            .links
            .entry(link.to_string())
            .or_default()
            .routes
            .insert((route.table, route.destination), route);
    }

    /// Injects a fault for every future call of `kind`.
    pub async fn inject(&self, kind: HostOpKind, fault: Fault) {
        self.state.write().await.faults.insert(kind, fault);
    }

    /// Removes all injected faults.
    pub async fn clear_faults(&self) {
        self.state.write().await.faults.clear();
    }

    /// Returns every mutation applied so far, in order.
    pub async fn mutations(&self) -> Vec<HostOp> {
        self.state.read().await.mutations.clone()
    }

    /// Forgets recorded mutations.
    pub async fn clear_mutations(&self) {
        self.state.write().await.mutations.clear();
    }

    /// Returns whether the link is up.
    pub async fn is_up(&self, link: &str) -> bool {
        self.state
            .read()
            .await
            .links
            .get(link)
            .is_some_and(|l| l.up)
    }

    /// Returns the MTU last set on the link.
    pub async fn mtu(&self, link: &str) -> Option<u16> {
        self.state
            .read()
            .await
            .links
            .get(link)
            .and_then(|l| l.mtu)
    }

    /// Returns the last configuration pushed to the device.
    pub async fn device(&self, link: &str) -> Option<InterfaceConfig> {
        self.state
            .read()
            .await
            .links
            .get(link)
            .and_then(|l| l.device.clone())
    }

    /// Returns the link's addresses.
    pub async fn addresses(&self, link: &str) -> Vec<IpNet> {
        self.state
            .read()
            .await
            .links
            .get(link)
            .map(|l| l.addresses.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns every route through the link, across tables.
    pub async fn routes(&self, link: &str) -> Vec<Route> {
        self.state
            .read()
            .await
            .links
            .get(link)
            .map(|l| l.routes.values().copied().collect())
            .unwrap_or_default()
    }
}

impl NetworkHost for FakeNetworkHost {
    async fn link_exists(&self, link: &str) -> Result<bool> {
        Ok(self.state.read().await.links.contains_key(link))
    }

    async fn create_link(&self, link: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Err(e) = state.check(HostOpKind::CreateLink, link) {
            if matches!(e, WireGuardError::LinkExists(_)) {
                state.links.entry(link.to_string()).or_default();
            }
            return Err(e);
        }
        if state.links.contains_key(link) {
            return Err(WireGuardError::LinkExists(link.to_string()));
        }
        state.links.insert(link.to_string(), FakeLink::default());
        state.mutations.push(HostOp::CreateLink(link.to_string()));
        Ok(())
    }

    async fn set_link_mtu(&self, link: &str, mtu: u16) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::SetMtu, link)?;
        state.link_mut(link)?.mtu = Some(mtu);
        state.mutations.push(HostOp::SetMtu(link.to_string(), mtu));
        Ok(())
    }

    async fn set_link_up(&self, link: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::SetLinkUp, link)?;
        state.link_mut(link)?.up = true;
        state.mutations.push(HostOp::SetLinkUp(link.to_string()));
        Ok(())
    }

    async fn configure_device(&self, link: &str, config: &InterfaceConfig) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::ConfigureDevice, link)?;
        state.link_mut(link)?.device = Some(config.clone());
        state.mutations.push(HostOp::ConfigureDevice {
            link: link.to_string(),
            peers: config.peers.len(),
        });
        Ok(())
    }

    async fn list_addresses(&self, link: &str) -> Result<Vec<IpNet>> {
        let state = self.state.read().await;
        state.check(HostOpKind::ListAddresses, link)?;
        Ok(state
            .link(link)?
            .addresses
            .iter()
            .filter(|a| matches!(a, IpNet::V4(_)))
            .copied()
            .collect())
    }

    async fn add_address(&self, link: &str, address: IpNet) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::AddAddress, &address.to_string())?;
        if !state.link_mut(link)?.addresses.insert(address) {
            return Err(WireGuardError::AddressExists(address.to_string()));
        }
        state
            .mutations
            .push(HostOp::AddAddress(link.to_string(), address));
        Ok(())
    }

    async fn remove_address(&self, link: &str, address: IpNet) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::RemoveAddress, &address.to_string())?;
        if !state.link_mut(link)?.addresses.remove(&address) {
            return Err(WireGuardError::AddressNotFound(address.to_string()));
        }
        state
            .mutations
            .push(HostOp::RemoveAddress(link.to_string(), address));
        Ok(())
    }

    async fn list_routes(&self, link: &str, table: Option<u32>) -> Result<Vec<IpNet>> {
        let state = self.state.read().await;
        state.check(HostOpKind::ListRoutes, link)?;
        Ok(state
            .link(link)?
            .routes
            .keys()
            .filter(|(t, dest)| *t == table && matches!(dest, IpNet::V4(_)))
            .map(|(_, dest)| *dest)
            .collect())
    }

    async fn add_route(&self, link: &str, route: &Route) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::AddRoute, &route.to_string())?;
        let key = (route.table, route.destination);
        let routes = &mut state.link_mut(link)?.routes;
        if routes.contains_key(&key) {
            return Err(WireGuardError::RouteExists(route.to_string()));
        }
        routes.insert(key, *route);
        state
            .mutations
            .push(HostOp::AddRoute(link.to_string(), *route));
        Ok(())
    }

    async fn remove_route(&self, link: &str, route: &Route) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(HostOpKind::RemoveRoute, &route.to_string())?;
        let key = (route.table, route.destination);
        if state.link_mut(link)?.routes.remove(&key).is_none() {
            return Err(WireGuardError::RouteNotFound(route.to_string()));
        }
        state
            .mutations
            .push(HostOp::RemoveRoute(link.to_string(), *route));
        Ok(())
    }
}
