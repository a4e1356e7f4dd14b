//! Reconciliation entry point
//!
//! A driver runs `manage(Mode::Target)` on every gateway to define the
//! target, its TPGs and the gateway's record entry, then
//! `manage(Mode::Map)` to export the provisioned disks. Outcomes are left in
//! the gateway's error slot for the driver to collect.

use crate::config::{Config, ConfigStore};
use crate::error::GatewayError;
use crate::kernel::TargetSubsystem;
use crate::target::Gateway;
use std::fmt;
use std::str::FromStr;

/// What a reconciliation run should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Define or reconcile the target, its TPGs and this gateway's record entry
    Target,
    /// Map provisioned storage objects into the existing target
    Map,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Self::Target => "target",
                Self::Map => "map",
            }
        )
    }
}

impl FromStr for Mode {
    type Err = GatewayError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val {
            "target" => Ok(Self::Target),
            "map" => Ok(Self::Map),
            _ => Err(GatewayError::Settings(format!(
                "unknown mode '{}', expected 'target' or 'map'",
                val
            ))),
        }
    }
}

impl<K: TargetSubsystem> Gateway<K> {
    /// Run one reconciliation pass against the kernel and the shared record
    pub fn manage<S: ConfigStore + ?Sized>(&mut self, mode: Mode, store: &S) {
        log::debug!("managing gateway {} in {} mode", self.node_name, mode);

        let mut config = match Config::load(store) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Unable to read the gateway configuration - {}", e);
                self.set_error(e);
                return;
            }
        };

        match mode {
            Mode::Target => self.manage_target(&mut config, store),
            Mode::Map => self.manage_map(&config),
        }
    }

    fn manage_target<S: ConfigStore + ?Sized>(&mut self, config: &mut Config, store: &S) {
        if self.exists() {
            self.load_config();
            if !self.has_error() {
                self.check_tpgs();
            }
        } else {
            self.create_target();
        }

        if self.has_error() {
            return;
        }

        if let Err(e) = self.update_membership(config) {
            log::error!("Unable to update the gateway configuration - {}", e);
            self.set_error(e);
            return;
        }

        if self.config_updated {
            if let Err(e) = config.commit(store) {
                log::error!("Unable to commit the gateway configuration - {}", e);
                self.set_error(e);
            }
        }
    }

    fn manage_map(&mut self, config: &Config) {
        if !self.exists() {
            let e = GatewayError::NotYetDefined(self.iqn.clone());
            log::error!("{}", e);
            self.set_error(e);
            return;
        }

        self.load_config();
        if self.has_error() {
            return;
        }
        self.map_luns(config);
    }
}
