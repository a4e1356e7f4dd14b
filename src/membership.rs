//! Gateway entries in the shared record
//!
//! Every gateway writes only its own entry, keyed by node name. The global
//! `iqn` and `ip_list` keys are set by whichever gateway gets there first;
//! all gateways would write the same values, so the race is harmless.

use crate::config::{Config, GatewayMetadata, GATEWAYS, GATEWAY_IP_LIST, GATEWAY_IQN};
use crate::error::GatewayResult;
use crate::kernel::TargetSubsystem;
use crate::target::Gateway;
use serde_json::Value;
use std::net::Ipv4Addr;

impl<K: TargetSubsystem> Gateway<K> {
    /// Metadata describing this gateway as it stands now
    pub fn metadata(&self) -> GatewayMetadata {
        GatewayMetadata {
            portal_ip_address: self.active_portal_ip,
            iqn: self.iqn.clone(),
            active_luns: 0,
            tpgs: self.tpgs.len(),
            inactive_portal_ips: self.inactive_portal_ips(),
            gateway_ip_list: self.gateway_ip_list.clone(),
        }
    }

    /// Bring the shared record in line with this gateway.
    ///
    /// Only touches the record in memory; `config_updated()` tells the caller
    /// whether a commit is needed.
    pub fn update_membership(&mut self, config: &mut Config) -> GatewayResult<()> {
        if !config.contains(GATEWAYS, GATEWAY_IQN) {
            config.add_item(GATEWAYS, GATEWAY_IQN, Some(Value::from(self.iqn.clone())));
            self.config_updated = true;
        }
        if !config.contains(GATEWAYS, GATEWAY_IP_LIST) {
            config.add_item(
                GATEWAYS,
                GATEWAY_IP_LIST,
                Some(serde_json::to_value(&self.gateway_ip_list)?),
            );
            self.config_updated = true;
        }

        match config.get(GATEWAYS, &self.node_name).cloned() {
            None => {
                let metadata = serde_json::to_value(self.metadata())?;
                config.add_item(GATEWAYS, &self.node_name, None);
                config.update_item(GATEWAYS, &self.node_name, metadata);
                self.config_updated = true;
                log::info!("added gateway {} to the configuration", self.node_name);
            }
            Some(mut details) => {
                let recorded: Option<Vec<Ipv4Addr>> = details
                    .get("gateway_ip_list")
                    .and_then(|list| serde_json::from_value(list.clone()).ok());
                if recorded.as_deref() != Some(self.gateway_ip_list.as_slice()) {
                    if let Value::Object(fields) = &mut details {
                        fields.insert("tpgs".to_string(), Value::from(self.tpgs.len()));
                        fields.insert(
                            "gateway_ip_list".to_string(),
                            serde_json::to_value(&self.gateway_ip_list)?,
                        );
                        fields.insert(
                            "inactive_portal_ips".to_string(),
                            serde_json::to_value(self.inactive_portal_ips())?,
                        );
                    } else {
                        details = serde_json::to_value(self.metadata())?;
                    }
                    config.update_item(GATEWAYS, &self.node_name, details);
                    self.config_updated = true;
                    log::info!(
                        "portal list of gateway {} changed, configuration updated",
                        self.node_name
                    );
                }
            }
        }

        Ok(())
    }
}
