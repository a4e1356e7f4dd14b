//! In-memory kernel target subsystem
//!
//! Behaves like LIO for the operations the gateway uses, without touching the
//! host. Failures can be injected per target, per portal address and per
//! storage object, and every object creation is counted so callers can
//! verify that a reconciliation pass was a no-op.

use crate::error::{kernel_error, GatewayResult};
use crate::kernel::{
    AluaGroup, AluaGroupEntry, AluaSettings, Lun, StorageObject, TargetSubsystem, Tpg,
};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
struct TpgState {
    tag: u16,
    enabled: bool,
    attributes: BTreeMap<String, String>,
    portals: Vec<Ipv4Addr>,
    luns: Vec<Lun>,
}

impl TpgState {
    fn snapshot(&self) -> Tpg {
        Tpg {
            tag: self.tag,
            enabled: self.enabled,
            portals: self.portals.clone(),
            luns: self.luns.clone(),
        }
    }
}

/// An ALUA group as held by [`MemoryKernel`]
#[derive(Debug, Clone)]
pub struct AluaGroupState {
    pub group: AluaGroup,
    /// Last settings written, `None` until configured
    pub settings: Option<AluaSettings>,
    /// Member LUNs as (target, tpg tag, lun number)
    pub members: Vec<(String, u16, u32)>,
}

#[derive(Debug, Default)]
pub struct MemoryKernel {
    targets: BTreeMap<String, Vec<TpgState>>,
    storage_objects: Vec<StorageObject>,
    /// Keyed by (storage object name, group name)
    alua_groups: BTreeMap<(String, String), AluaGroupState>,
    fail_target: bool,
    fail_portals: BTreeSet<Ipv4Addr>,
    fail_luns: BTreeSet<String>,
    creations: usize,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backstore object, as the disk provisioning step would
    pub fn add_storage_object(&mut self, storage_object: StorageObject) {
        self.storage_objects.push(storage_object);
    }

    /// Make the next target creations fail
    pub fn fail_target_creation(&mut self, fail: bool) {
        self.fail_target = fail;
    }

    /// Make portal creation on `ip` fail
    pub fn fail_portal(&mut self, ip: Ipv4Addr) {
        self.fail_portals.insert(ip);
    }

    /// Make LUN creation for the named storage object fail
    pub fn fail_lun(&mut self, storage_object: &str) {
        self.fail_luns.insert(storage_object.to_string());
    }

    pub fn clear_failures(&mut self) {
        self.fail_target = false;
        self.fail_portals.clear();
        self.fail_luns.clear();
    }

    /// Number of objects (targets, TPGs, portals, LUNs, ALUA groups) created so far
    pub fn creations(&self) -> usize {
        self.creations
    }

    pub fn tpg_attribute(&self, iqn: &str, tag: u16, name: &str) -> Option<&str> {
        self.targets
            .get(iqn)?
            .iter()
            .find(|tpg| tpg.tag == tag)?
            .attributes
            .get(name)
            .map(String::as_str)
    }

    pub fn alua_group(&self, storage_object: &str, name: &str) -> Option<&AluaGroupState> {
        self.alua_groups
            .get(&(storage_object.to_string(), name.to_string()))
    }

    fn tpg_mut(&mut self, iqn: &str, tag: u16) -> GatewayResult<&mut TpgState> {
        self.targets
            .get_mut(iqn)
            .ok_or_else(|| kernel_error(format!("target {} does not exist", iqn)))?
            .iter_mut()
            .find(|tpg| tpg.tag == tag)
            .ok_or_else(|| kernel_error(format!("tpg {} of {} does not exist", tag, iqn)))
    }

    fn check_storage_object(&self, storage_object: &StorageObject) -> GatewayResult<()> {
        if self.storage_objects.contains(storage_object) {
            Ok(())
        } else {
            Err(kernel_error(format!(
                "storage object {}/{} does not exist",
                storage_object.hba(),
                storage_object.name
            )))
        }
    }
}

impl TargetSubsystem for MemoryKernel {
    fn target_exists(&self, iqn: &str) -> bool {
        self.targets.contains_key(iqn)
    }

    fn list_targets(&self) -> GatewayResult<Vec<String>> {
        Ok(self.targets.keys().cloned().collect())
    }

    fn create_target(&mut self, iqn: &str) -> GatewayResult<()> {
        if self.fail_target {
            return Err(kernel_error(format!("unable to create target {}", iqn)));
        }
        if self.targets.contains_key(iqn) {
            return Err(kernel_error(format!("target {} already exists", iqn)));
        }
        self.targets.insert(iqn.to_string(), Vec::new());
        self.creations += 1;
        Ok(())
    }

    fn delete_target(&mut self, iqn: &str) -> GatewayResult<()> {
        self.targets
            .remove(iqn)
            .ok_or_else(|| kernel_error(format!("target {} does not exist", iqn)))?;
        for state in self.alua_groups.values_mut() {
            state.members.retain(|(target, _, _)| target != iqn);
        }
        Ok(())
    }

    fn create_tpg(&mut self, iqn: &str) -> GatewayResult<u16> {
        let tpgs = self
            .targets
            .get_mut(iqn)
            .ok_or_else(|| kernel_error(format!("target {} does not exist", iqn)))?;
        let tag = tpgs.iter().map(|tpg| tpg.tag + 1).max().unwrap_or(0);
        tpgs.push(TpgState {
            tag,
            enabled: false,
            attributes: BTreeMap::new(),
            portals: Vec::new(),
            luns: Vec::new(),
        });
        self.creations += 1;
        Ok(tag)
    }

    fn tpgs(&self, iqn: &str) -> GatewayResult<Vec<Tpg>> {
        let tpgs = self
            .targets
            .get(iqn)
            .ok_or_else(|| kernel_error(format!("target {} does not exist", iqn)))?;
        let mut tpgs: Vec<Tpg> = tpgs.iter().map(TpgState::snapshot).collect();
        tpgs.sort_by_key(|tpg| tpg.tag);
        Ok(tpgs)
    }

    fn set_tpg_enabled(&mut self, iqn: &str, tag: u16, enabled: bool) -> GatewayResult<()> {
        self.tpg_mut(iqn, tag)?.enabled = enabled;
        Ok(())
    }

    fn set_tpg_attribute(
        &mut self,
        iqn: &str,
        tag: u16,
        name: &str,
        value: &str,
    ) -> GatewayResult<()> {
        self.tpg_mut(iqn, tag)?
            .attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn create_network_portal(&mut self, iqn: &str, tag: u16, ip: Ipv4Addr) -> GatewayResult<()> {
        if self.fail_portals.contains(&ip) {
            return Err(kernel_error(format!("unable to bind portal {}", ip)));
        }
        let tpg = self.tpg_mut(iqn, tag)?;
        if tpg.portals.contains(&ip) {
            return Err(kernel_error(format!(
                "portal {} already exists on tpg {}",
                ip, tag
            )));
        }
        tpg.portals.push(ip);
        self.creations += 1;
        Ok(())
    }

    fn storage_objects(&self) -> GatewayResult<Vec<StorageObject>> {
        Ok(self.storage_objects.clone())
    }

    fn create_lun(
        &mut self,
        iqn: &str,
        tag: u16,
        lun: u32,
        storage_object: &StorageObject,
    ) -> GatewayResult<Lun> {
        if self.fail_luns.contains(&storage_object.name) {
            return Err(kernel_error(format!(
                "unable to map {} as lun {}",
                storage_object.name, lun
            )));
        }
        self.check_storage_object(storage_object)?;
        let tpg = self.tpg_mut(iqn, tag)?;
        if tpg.luns.iter().any(|l| l.lun == lun) {
            return Err(kernel_error(format!("lun {} already exists on tpg {}", lun, tag)));
        }
        let mapped = Lun {
            tpg_tag: tag,
            lun,
            storage_object: storage_object.name.clone(),
        };
        tpg.luns.push(mapped.clone());
        self.creations += 1;
        Ok(mapped)
    }

    fn create_or_get_alua_group(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        tpg_id: u16,
    ) -> GatewayResult<AluaGroupEntry> {
        self.check_storage_object(storage_object)?;
        let key = (storage_object.name.clone(), name.to_string());
        if let Some(state) = self.alua_groups.get(&key) {
            return Ok(AluaGroupEntry::Existing(state.group.clone()));
        }
        let group = AluaGroup {
            name: name.to_string(),
            tpg_id,
        };
        self.alua_groups.insert(
            key,
            AluaGroupState {
                group: group.clone(),
                settings: None,
                members: Vec::new(),
            },
        );
        self.creations += 1;
        Ok(AluaGroupEntry::Created(group))
    }

    fn configure_alua_group(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        settings: &AluaSettings,
    ) -> GatewayResult<()> {
        let state = self
            .alua_groups
            .get_mut(&(storage_object.name.clone(), name.to_string()))
            .ok_or_else(|| kernel_error(format!("alua group {} does not exist", name)))?;
        state.settings = Some(*settings);
        Ok(())
    }

    fn bind_alua_lun(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        iqn: &str,
        lun: &Lun,
    ) -> GatewayResult<()> {
        let key = (storage_object.name.clone(), name.to_string());
        if !self.alua_groups.contains_key(&key) {
            return Err(kernel_error(format!("alua group {} does not exist", name)));
        }
        let member = (iqn.to_string(), lun.tpg_tag, lun.lun);
        // A LUN belongs to exactly one group of its storage object
        for ((so, _), state) in self.alua_groups.iter_mut() {
            if *so == storage_object.name {
                state.members.retain(|m| *m != member);
            }
        }
        if let Some(state) = self.alua_groups.get_mut(&key) {
            state.members.push(member);
        }
        Ok(())
    }
}
