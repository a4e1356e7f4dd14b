//! ALUA path state
//!
//! Each mapped LUN reports to initiators whether the path through this TPG
//! is the preferred one. The gateway named as the disk's `owner` in the
//! shared record holds the active/optimized path; every other TPG reports
//! active/non-optimized.
//!
//! Groups are created per storage object: one `ao` group for the owning
//! TPG and one `ano<tag>` group per non-owning TPG. A group's id is the tag
//! of the TPG it was created for and must never change afterwards.

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::kernel::{
    AluaAccessState, AluaGroupEntry, AluaSettings, Lun, StorageObject, TargetSubsystem, Tpg,
};
use crate::target::Gateway;
use std::net::Ipv4Addr;

/// Group holding the owner's active/optimized path
pub const OPTIMIZED_GROUP: &str = "ao";

/// Group name for a non-owning TPG
pub fn non_optimized_group(tag: u16) -> String {
    format!("ano{}", tag)
}

/// What a bind did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AluaBinding {
    pub group: String,
    pub tpg_id: u16,
    pub access_state: AluaAccessState,
    /// The group already existed (re-run or restart)
    pub reused: bool,
}

/// Bind `lun` to the ALUA group matching this TPG's role for the disk.
///
/// `tpg_ip` is the TPG's portal address when the caller knows it; otherwise
/// the TPG's first portal is used. A TPG without portals (early boot, before
/// the portal is attached) is left alone and `Ok(None)` is returned.
///
/// All group attributes are rewritten on every call, so binding again after
/// a partial failure is safe.
pub fn bind_alua_group_to_lun<K: TargetSubsystem + ?Sized>(
    kernel: &mut K,
    config: &Config,
    iqn: &str,
    tpg: &Tpg,
    storage_object: &StorageObject,
    lun: &Lun,
    tpg_ip: Option<Ipv4Addr>,
) -> GatewayResult<Option<AluaBinding>> {
    let Some(tpg_ip) = tpg_ip.or_else(|| tpg.portals.first().copied()) else {
        log::debug!(
            "tpg {} has no portal yet, ALUA binding of {} deferred",
            tpg.tag,
            storage_object.name
        );
        return Ok(None);
    };

    let owner = config.disk_owner(&storage_object.name)?;
    let owner_ip = config.portal_ip(&owner)?;

    let (group, access_state) = if owner_ip == tpg_ip {
        log::info!(
            "setting {} to ALUA/ActiveOptimised group id {}",
            storage_object.name,
            tpg.tag
        );
        (OPTIMIZED_GROUP.to_string(), AluaAccessState::ActiveOptimized)
    } else {
        log::info!(
            "setting {} to ALUA/ActiveNONOptimised group id {}",
            storage_object.name,
            tpg.tag
        );
        (
            non_optimized_group(tpg.tag),
            AluaAccessState::ActiveNonOptimized,
        )
    };

    let reused = match kernel.create_or_get_alua_group(storage_object, &group, tpg.tag)? {
        AluaGroupEntry::Created(_) => false,
        AluaGroupEntry::Existing(existing) => {
            log::info!(
                "ALUA group id {} for stg obj {} lun {} already made",
                existing.tpg_id,
                storage_object.name,
                lun.lun
            );
            if existing.tpg_id != tpg.tag {
                return Err(GatewayError::TopologyMismatch {
                    storage_object: storage_object.name.clone(),
                    group,
                    recorded: existing.tpg_id,
                    current: tpg.tag,
                });
            }
            true
        }
    };

    kernel.configure_alua_group(storage_object, &group, &AluaSettings::explicit(access_state))?;
    kernel.bind_alua_lun(storage_object, &group, iqn, lun)?;

    Ok(Some(AluaBinding {
        group,
        tpg_id: tpg.tag,
        access_state,
        reused,
    }))
}

impl<K: TargetSubsystem> Gateway<K> {
    /// Bind one of this target's LUNs to its ALUA group
    pub fn bind_alua_group_to_lun(
        &mut self,
        config: &Config,
        lun: &Lun,
        tpg_ip: Option<Ipv4Addr>,
    ) -> GatewayResult<Option<AluaBinding>> {
        let tpg = self
            .tpgs
            .iter()
            .find(|tpg| tpg.tag == lun.tpg_tag)
            .cloned()
            .ok_or_else(|| {
                GatewayError::KernelObject(format!(
                    "tpg {} is not part of target {}",
                    lun.tpg_tag, self.iqn
                ))
            })?;
        let storage_object = self
            .kernel
            .storage_objects()?
            .into_iter()
            .find(|so| so.name == lun.storage_object)
            .ok_or_else(|| {
                GatewayError::KernelObject(format!(
                    "storage object {} does not exist",
                    lun.storage_object
                ))
            })?;
        bind_alua_group_to_lun(
            &mut self.kernel,
            config,
            &self.iqn,
            &tpg,
            &storage_object,
            lun,
            tpg_ip,
        )
    }

    /// Attach the active portal to the enabled TPG and bind its LUNs.
    ///
    /// Used when the target was defined with `enable_portal` off, so the
    /// portal comes up only once the node is ready to serve it.
    pub fn enable_active_tpg(&mut self, config: &Config) {
        let active = self.active_portal_ip;
        let Some(index) = self.tpgs.iter().position(|tpg| tpg.enabled) else {
            log::warn!("target {} has no enabled tpg", self.iqn);
            return;
        };

        for lun in self.tpgs[index].luns.clone() {
            match self.bind_alua_group_to_lun(config, &lun, Some(active)) {
                Ok(_) => {}
                Err(e) => {
                    log::error!("Unable to bind lun {} to its ALUA group - {}", lun.lun, e);
                    self.set_error(e);
                }
            }
        }

        let tag = self.tpgs[index].tag;
        if self.tpgs[index].has_portal(active) {
            log::debug!("portal {} already bound to tpg {}", active, tag);
            return;
        }
        match self.kernel.create_network_portal(&self.iqn, tag, active) {
            Ok(()) => {
                self.tpgs[index].portals.push(active);
                self.changes_made = true;
                log::info!("portal {} enabled on tpg {}", active, tag);
            }
            Err(e) => {
                log::error!("Unable to add portal {} to tpg {} - {}", active, tag, e);
                self.set_error(e);
            }
        }
    }
}
