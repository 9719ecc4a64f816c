//! Host convergence.
//!
//! [`HostSynchronizer::apply`] drives the link, device, addresses and routes
//! of one interface toward an [`InterfaceConfig`] using set differences
//! against what the kernel reports. Steps run in order; a failing step ends
//! the pass and nothing already applied is rolled back.

use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use tracing::{debug, info, Instrument, Span};

use crate::config::InterfaceConfig;
use crate::error::{SyncError, SyncStep, WireGuardError};
use crate::host::{NetworkHost, Route};

/// What a successful [`HostSynchronizer::apply`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// The link had to be created.
    pub link_created: bool,
    /// Addresses assigned.
    pub addresses_added: Vec<IpNet>,
    /// Addresses removed.
    pub addresses_removed: Vec<IpNet>,
    /// Routes installed.
    pub routes_added: Vec<IpNet>,
    /// Routes deleted.
    pub routes_removed: Vec<IpNet>,
}

impl SyncReport {
    /// Returns true if no link, address or route changed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.link_created
            && self.addresses_added.is_empty()
            && self.addresses_removed.is_empty()
            && self.routes_added.is_empty()
            && self.routes_removed.is_empty()
    }
}

/// Converges a host's interface state to a desired configuration.
#[derive(Debug)]
pub struct HostSynchronizer<H> {
    host: H,
    span: Span,
}

impl<H: NetworkHost> HostSynchronizer<H> {
    /// Creates a synchronizer with its own span.
    pub fn new(host: H) -> Self {
        Self::with_span(host, tracing::info_span!("host_sync"))
    }

    /// Creates a synchronizer that logs under `span`.
    pub fn with_span(host: H, span: Span) -> Self {
        Self { host, span }
    }

    /// Returns the underlying host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Applies `config` to `link`.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] naming the first step that failed.
    pub async fn apply(
        &self,
        link: &str,
        config: &InterfaceConfig,
    ) -> Result<SyncReport, SyncError> {
        let span = tracing::info_span!(parent: &self.span, "apply", iface = %link);
        async {
            let mut report = SyncReport::default();
            let fail = |step: SyncStep| {
                move |source: WireGuardError| SyncError {
                    step,
                    link: link.to_string(),
                    source,
                }
            };

            report.link_created = self
                .ensure_link(link, config.mtu)
                .await
                .map_err(fail(SyncStep::Link))?;

            self.host
                .configure_device(link, config)
                .await
                .map_err(fail(SyncStep::Device))?;
            debug!(peers = config.peers.len(), "device configured");

            self.sync_addresses(link, config, &mut report)
                .await
                .map_err(fail(SyncStep::Addresses))?;
            self.sync_routes(link, config, &mut report)
                .await
                .map_err(fail(SyncStep::Routes))?;

            if report.is_noop() {
                debug!("host already converged");
            } else {
                info!(
                    addresses_added = report.addresses_added.len(),
                    addresses_removed = report.addresses_removed.len(),
                    routes_added = report.routes_added.len(),
                    routes_removed = report.routes_removed.len(),
                    "host converged"
                );
            }
            Ok::<_, SyncError>(report)
        }
        .instrument(span)
        .await
    }

    async fn ensure_link(&self, link: &str, mtu: Option<u16>) -> Result<bool, WireGuardError> {
        let mut created = false;
        if !self.host.link_exists(link).await? {
            match self.host.create_link(link).await {
                Ok(()) => {
                    info!("link created");
                    created = true;
                }
                Err(WireGuardError::LinkExists(_)) => debug!("link appeared concurrently"),
                Err(e) => return Err(e),
            }
        }
        if let Some(mtu) = mtu {
            self.host.set_link_mtu(link, mtu).await?;
        }
        self.host.set_link_up(link).await?;
        Ok(created)
    }

    async fn sync_addresses(
        &self,
        link: &str,
        config: &InterfaceConfig,
        report: &mut SyncReport,
    ) -> Result<(), WireGuardError> {
        let desired: BTreeSet<IpNet> = std::iter::once(*config.address.network())
            .filter(|a| matches!(a, IpNet::V4(_)))
            .collect();
        let current: BTreeSet<IpNet> = self.host.list_addresses(link).await?.into_iter().collect();

        for address in desired.difference(&current) {
            match self.host.add_address(link, *address).await {
                Ok(()) => {
                    info!(address = %address, "address added");
                    report.addresses_added.push(*address);
                }
                Err(WireGuardError::AddressExists(_)) => {
                    debug!(address = %address, "address already present");
                }
                Err(e) => return Err(e),
            }
        }
        for address in current.difference(&desired) {
            match self.host.remove_address(link, *address).await {
                Ok(()) => {
                    info!(address = %address, "address removed");
                    report.addresses_removed.push(*address);
                }
                Err(WireGuardError::AddressNotFound(_)) => {
                    debug!(address = %address, "address already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn sync_routes(
        &self,
        link: &str,
        config: &InterfaceConfig,
        report: &mut SyncReport,
    ) -> Result<(), WireGuardError> {
        let routing = &config.routing;
        let desired: BTreeMap<IpNet, Route> = config
            .route_destinations()
            .into_keys()
            .filter(|dest| matches!(dest, IpNet::V4(_)))
            .map(|dest| (dest, Route::new(dest, routing)))
            .collect();
        let current: BTreeSet<IpNet> = self
            .host
            .list_routes(link, routing.table)
            .await?
            .into_iter()
            .map(|dest| dest.trunc())
            .collect();

        for (dest, route) in desired.iter().filter(|(d, _)| !current.contains(*d)) {
            match self.host.add_route(link, route).await {
                Ok(()) => {
                    info!(route = %route, "route added");
                    report.routes_added.push(*dest);
                }
                Err(WireGuardError::RouteExists(_)) => {
                    debug!(route = %route, "route already present");
                }
                Err(e) => return Err(e),
            }
        }
        for dest in current.iter().filter(|d| !desired.contains_key(*d)) {
            let route = Route::new(*dest, routing);
            match self.host.remove_route(link, &route).await {
                Ok(()) => {
                    info!(route = %route, "route removed");
                    report.routes_removed.push(*dest);
                }
                Err(WireGuardError::RouteNotFound(_)) => {
                    debug!(route = %route, "route already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
