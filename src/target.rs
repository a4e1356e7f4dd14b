//! Gateway state and target lifecycle
//!
//! A [`Gateway`] is built for one reconciliation run. It owns the kernel
//! handle, remembers which portal address is local, and collects the TPG
//! snapshots of the target as they are loaded or created. Failures of kernel
//! operations are kept in the gateway's error slot instead of being returned,
//! so a driver can inspect and aggregate them.

use crate::address::{local_ipv4_addresses, match_active_portal};
use crate::error::{GatewayError, GatewayResult};
use crate::kernel::{TargetSubsystem, Tpg, SENDTARGETS_ATTRIBUTE};
use crate::reconcile::plan_portals;
use crate::settings::{validate_iqn, GatewaySettings};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Local view of one gateway node
#[derive(Debug)]
pub struct Gateway<K: TargetSubsystem> {
    pub(crate) kernel: K,
    pub(crate) iqn: String,
    pub(crate) node_name: String,
    pub(crate) gateway_ip_list: Vec<Ipv4Addr>,
    pub(crate) active_portal_ip: Ipv4Addr,
    pub(crate) enable_portal: bool,
    /// TPGs of the target, loaded or created during this run
    pub(crate) tpgs: Vec<Tpg>,
    pub(crate) error: Option<GatewayError>,
    /// Kernel objects were created
    pub(crate) changes_made: bool,
    /// The shared record was modified
    pub(crate) config_updated: bool,
}

impl<K: TargetSubsystem> Gateway<K> {
    /// Create a new builder for configuring the gateway
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn iqn(&self) -> &str {
        &self.iqn
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn gateway_ip_list(&self) -> &[Ipv4Addr] {
        &self.gateway_ip_list
    }

    pub fn active_portal_ip(&self) -> Ipv4Addr {
        self.active_portal_ip
    }

    /// Portal addresses served by the other gateways
    pub fn inactive_portal_ips(&self) -> Vec<Ipv4Addr> {
        self.gateway_ip_list
            .iter()
            .copied()
            .filter(|ip| *ip != self.active_portal_ip)
            .collect()
    }

    pub fn tpgs(&self) -> &[Tpg] {
        &self.tpgs
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Hand back the kernel handle once the run is over
    pub fn into_kernel(self) -> K {
        self.kernel
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    /// Message of the recorded error, empty when there is none
    pub fn error_msg(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    pub fn changes_made(&self) -> bool {
        self.changes_made
    }

    pub fn config_updated(&self) -> bool {
        self.config_updated
    }

    pub(crate) fn set_error(&mut self, err: GatewayError) {
        self.error = Some(err);
    }

    /// Check whether the target is registered with the kernel
    pub fn exists(&self) -> bool {
        self.kernel.target_exists(&self.iqn)
    }

    /// Create the target and one TPG per cluster portal.
    ///
    /// TPGs are created in `gateway_ip_list` order so that every gateway
    /// associates the same TPG number with the same address. Only the TPG of
    /// the local address is enabled; the others exist so that an initiator
    /// asking any one gateway for its port groups learns about all of them.
    /// If any TPG fails the target is deleted again.
    pub fn create_target(&mut self) {
        if let Err(e) = self.kernel.create_target(&self.iqn) {
            log::error!("Unable to create the Target definition - {}", e);
            self.set_error(e);
            return;
        }
        log::debug!("Added iscsi target - {}", self.iqn);

        log::debug!("Creating tpgs");
        for ip in self.gateway_ip_list.clone() {
            if let Err(e) = self.create_tpg(ip) {
                log::error!("Unable to create the TPG for {} - {}", ip, e);
                self.set_error(e);
            }
        }

        if self.has_error() {
            self.delete();
        } else {
            self.changes_made = true;
            log::info!("created an iscsi target with iqn of '{}'", self.iqn);
        }
    }

    /// Create one TPG serving `ip` and append it to the gateway's list
    pub fn create_tpg(&mut self, ip: Ipv4Addr) -> GatewayResult<()> {
        let tag = self.kernel.create_tpg(&self.iqn)?;
        log::debug!("Added tpg {} for portal ip {}", tag, ip);

        let enabled = ip == self.active_portal_ip;
        if enabled {
            if self.enable_portal {
                self.kernel.create_network_portal(&self.iqn, tag, ip)?;
            }
            self.kernel.set_tpg_enabled(&self.iqn, tag, true)?;
            log::debug!("tpg {} for portal ip {} is enabled", tag, ip);
        } else {
            self.kernel.create_network_portal(&self.iqn, tag, ip)?;
            self.kernel.set_tpg_enabled(&self.iqn, tag, false)?;
            // discovery through one gateway already reports every portal
            self.kernel
                .set_tpg_attribute(&self.iqn, tag, SENDTARGETS_ATTRIBUTE, "0")?;
            log::debug!("tpg {} for portal ip {} is disabled", tag, ip);
        }

        let portals = if enabled && !self.enable_portal {
            Vec::new()
        } else {
            vec![ip]
        };
        self.tpgs.push(Tpg {
            tag,
            enabled,
            portals,
            luns: Vec::new(),
        });
        self.changes_made = true;
        Ok(())
    }

    /// Load the existing target's TPGs from the kernel
    pub fn load_config(&mut self) {
        match self.kernel.list_targets() {
            Ok(targets) if targets.len() > 1 => {
                log::warn!(
                    "{} iscsi targets are defined, only '{}' is managed",
                    targets.len(),
                    self.iqn
                );
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Unable to list iscsi targets - {}", e);
                self.set_error(e);
                return;
            }
        }

        match self.kernel.tpgs(&self.iqn) {
            Ok(tpgs) => {
                self.tpgs = tpgs;
                log::info!("successfully loaded existing target definition");
            }
            Err(e) => {
                log::error!("Unable to load target '{}' - {}", self.iqn, e);
                self.set_error(e);
            }
        }
    }

    /// Create TPGs for cluster portals that no existing TPG serves
    pub fn check_tpgs(&mut self) {
        let plan = plan_portals(&self.tpgs, &self.gateway_ip_list);
        if plan.is_empty() {
            log::debug!("all {} portals have a tpg", plan.matched.len());
            return;
        }

        log::info!("An additional {} tpg's are required", plan.missing.len());
        for ip in plan.missing {
            if let Err(e) = self.create_tpg(ip) {
                log::error!("Unable to create the TPG for {} - {}", ip, e);
                self.set_error(e);
            }
        }
    }

    /// Remove the target from the kernel
    pub fn delete(&mut self) {
        if !self.exists() {
            return;
        }
        match self.kernel.delete_target(&self.iqn) {
            Ok(()) => {
                self.tpgs.clear();
                self.changes_made = false;
                log::info!("removed iscsi target '{}'", self.iqn);
            }
            Err(e) => {
                log::error!("Unable to remove target '{}' - {}", self.iqn, e);
            }
        }
    }
}

/// Builder for configuring a [`Gateway`]
#[derive(Debug, Default)]
pub struct GatewayBuilder {
    iqn: Option<String>,
    gateway_ip_list: Vec<Ipv4Addr>,
    local_addresses: Option<BTreeSet<Ipv4Addr>>,
    node_name: Option<String>,
    enable_portal: Option<bool>,
}

impl GatewayBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Start from local settings
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            iqn: Some(settings.iqn.clone()),
            gateway_ip_list: settings.gateway_ip_list.clone(),
            local_addresses: None,
            node_name: settings.node_name.clone(),
            enable_portal: Some(settings.enable_portal),
        }
    }

    /// Set the iSCSI target name (IQN format)
    pub fn iqn(mut self, iqn: &str) -> Self {
        self.iqn = Some(iqn.to_string());
        self
    }

    /// Set the ordered cluster portal list
    pub fn gateway_ip_list(mut self, ips: &[Ipv4Addr]) -> Self {
        self.gateway_ip_list = ips.to_vec();
        self
    }

    /// Use these addresses instead of enumerating the host's interfaces
    pub fn local_addresses<I: IntoIterator<Item = Ipv4Addr>>(mut self, addrs: I) -> Self {
        self.local_addresses = Some(addrs.into_iter().collect());
        self
    }

    /// Set the node identifier (default: short hostname)
    pub fn node_name(mut self, name: &str) -> Self {
        self.node_name = Some(name.to_string());
        self
    }

    /// Whether the active TPG gets its portal at creation (default: true)
    pub fn enable_portal(mut self, enable: bool) -> Self {
        self.enable_portal = Some(enable);
        self
    }

    /// Build the gateway on top of the given kernel handle
    ///
    /// Fails with [`GatewayError::NoMatchingAddress`] when no cluster portal
    /// is local, before any kernel object is touched.
    pub fn build<K: TargetSubsystem>(self, kernel: K) -> GatewayResult<Gateway<K>> {
        let iqn = self
            .iqn
            .ok_or_else(|| GatewayError::Settings("an iqn is required".to_string()))?;
        validate_iqn(&iqn)?;

        let local = match self.local_addresses {
            Some(addrs) => addrs,
            None => local_ipv4_addresses()?,
        };
        let active_portal_ip = match_active_portal(&self.gateway_ip_list, &local)?;
        log::debug!(
            "tpg's will be defined in this order - {:?}",
            self.gateway_ip_list
        );

        let node_name = match self.node_name {
            Some(name) => name,
            None => short_hostname()?,
        };

        Ok(Gateway {
            kernel,
            iqn,
            node_name,
            gateway_ip_list: self.gateway_ip_list,
            active_portal_ip,
            enable_portal: self.enable_portal.unwrap_or(true),
            tpgs: Vec::new(),
            error: None,
            changes_made: false,
            config_updated: false,
        })
    }
}

/// Hostname up to the first dot
fn short_hostname() -> GatewayResult<String> {
    let hostname = nix::unistd::gethostname()?;
    let hostname = hostname.to_string_lossy();
    Ok(hostname.split('.').next().unwrap_or_default().to_string())
}
