//! LUN mapping
//!
//! Storage objects are provisioned in the kernel by a separate step. Mapping
//! exports every one of them through every TPG of the target, numbering the
//! LUN after the object's backstore slot so repeated runs (and every gateway)
//! agree on the number.

use crate::alua::bind_alua_group_to_lun;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::kernel::{StorageObject, TargetSubsystem, Tpg};
use crate::target::Gateway;

/// LUN number for a storage object: the slot of its backstore
/// (`core/iblock_3/disk_a` maps as LUN 3).
pub fn lun_id(storage_object: &StorageObject) -> u32 {
    storage_object.slot
}

/// Check whether the storage object is already exported through the TPG
pub fn lun_mapped(tpg: &Tpg, storage_object: &StorageObject) -> bool {
    tpg.luns
        .iter()
        .any(|lun| lun.storage_object == storage_object.name)
}

impl<K: TargetSubsystem> Gateway<K> {
    /// Map every kernel storage object into every TPG of the target.
    ///
    /// A failed LUN creation is recorded and skips the remaining storage
    /// objects of that TPG only; later TPGs are still mapped. An ALUA
    /// topology mismatch or an unreadable ownership record stops the pass.
    pub fn map_luns(&mut self, config: &Config) {
        if let Err(e) = self.try_map_luns(config) {
            log::error!("LUN mapping for {} stopped - {}", self.iqn, e);
            self.set_error(e);
        }
    }

    fn try_map_luns(&mut self, config: &Config) -> GatewayResult<()> {
        let storage_objects = self.kernel.storage_objects()?;

        for index in 0..self.tpgs.len() {
            for storage_object in &storage_objects {
                if lun_mapped(&self.tpgs[index], storage_object) {
                    continue;
                }

                let tag = self.tpgs[index].tag;
                let id = lun_id(storage_object);
                let lun = match self.kernel.create_lun(&self.iqn, tag, id, storage_object) {
                    Ok(lun) => lun,
                    Err(e) => {
                        log::error!(
                            "Unable to map {} as lun {} on tpg {} - {}",
                            storage_object.name,
                            id,
                            tag,
                            e
                        );
                        self.set_error(e);
                        break;
                    }
                };
                log::debug!("mapped {} as lun {} on tpg {}", storage_object.name, id, tag);
                self.changes_made = true;
                self.tpgs[index].luns.push(lun.clone());

                let result = bind_alua_group_to_lun(
                    &mut self.kernel,
                    config,
                    &self.iqn,
                    &self.tpgs[index],
                    storage_object,
                    &lun,
                    None,
                );
                match result {
                    Ok(_) => {}
                    Err(e @ (GatewayError::TopologyMismatch { .. } | GatewayError::Config(_))) => {
                        return Err(e)
                    }
                    Err(e) => {
                        log::error!(
                            "Unable to bind {} lun {} to its ALUA group - {}",
                            storage_object.name,
                            id,
                            e
                        );
                        self.set_error(e);
                    }
                }
            }
        }

        Ok(())
    }
}
