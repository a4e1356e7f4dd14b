//! Local gateway settings
//!
//! Every node carries a small TOML file naming the target and the ordered
//! cluster portal list:
//!
//! ```toml
//! iqn = "iqn.2003-01.com.example.iscsi-gw:iscsi-igw"
//! gateway_ip_list = ["10.0.0.1", "10.0.0.2"]
//! enable_portal = true
//! ```

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Gets the path of the local settings file.
pub fn default_settings_path() -> String {
    match std::env::var("ISCSI_GATEWAY_CONFIG") {
        Ok(path) => path,
        Err(_) => "/etc/iscsi-gateway/gateway.toml".to_string(),
    }
}

/// Gets the path of the shared gateway record when it is kept in a file.
pub fn default_record_path() -> String {
    match std::env::var("ISCSI_GATEWAY_RECORD") {
        Ok(path) => path,
        Err(_) => "/etc/iscsi-gateway/gateway.conf".to_string(),
    }
}

pub fn default_configfs_root() -> String {
    match std::env::var("ISCSI_GATEWAY_CONFIGFS") {
        Ok(root) => root,
        Err(_) => crate::configfs::DEFAULT_CONFIGFS_ROOT.to_string(),
    }
}

fn enable_portal_default() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub iqn: String,
    /// Cluster portal addresses, in the same order on every gateway
    pub gateway_ip_list: Vec<Ipv4Addr>,
    /// Node identifier; the short hostname when absent
    pub node_name: Option<String>,
    /// Create the active portal together with its TPG
    #[serde(default = "enable_portal_default")]
    pub enable_portal: bool,
    pub configfs_root: Option<PathBuf>,
    /// Shared record file
    pub config_path: Option<PathBuf>,
}

impl GatewaySettings {
    pub fn from_toml_str(contents: &str) -> GatewayResult<Self> {
        let settings: GatewaySettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Settings(format!("could not open {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks that hold before any kernel object is touched
    pub fn validate(&self) -> GatewayResult<()> {
        validate_iqn(&self.iqn)?;
        if self.gateway_ip_list.is_empty() {
            return Err(GatewayError::Settings(
                "gateway_ip_list must name at least one portal".to_string(),
            ));
        }
        for (i, ip) in self.gateway_ip_list.iter().enumerate() {
            if self.gateway_ip_list[..i].contains(ip) {
                return Err(GatewayError::Settings(format!(
                    "portal {} is listed more than once",
                    ip
                )));
            }
        }
        Ok(())
    }

    pub fn configfs_root(&self) -> PathBuf {
        self.configfs_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_configfs_root()))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_record_path()))
    }
}

pub(crate) fn validate_iqn(iqn: &str) -> GatewayResult<()> {
    if !iqn.starts_with("iqn.") {
        return Err(GatewayError::Settings(format!(
            "'{}' must be in IQN format (e.g., iqn.2003-01.com.example.iscsi-gw:iscsi-igw)",
            iqn
        )));
    }
    Ok(())
}
