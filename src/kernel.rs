//! Kernel target subsystem interface
//!
//! The kernel-resident SCSI target (LIO) stores and serves targets, TPGs,
//! portals, LUNs and ALUA groups. Reconciliation only creates, binds and
//! queries those objects, through the [`TargetSubsystem`] trait. Two
//! implementations ship with the crate: [`crate::configfs::ConfigFs`] for a
//! live configfs tree and [`crate::memory::MemoryKernel`] for tests.

use crate::error::GatewayResult;
use std::net::Ipv4Addr;

/// Default iSCSI port used for network portals
pub const ISCSI_PORT: u16 = 3260;

/// TPG attribute that controls whether discovery through this TPG returns
/// every portal of the target.
pub const SENDTARGETS_ATTRIBUTE: &str = "tpg_enabled_sendtargets";

/// Snapshot of a target portal group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpg {
    /// Tag, also used as the ALUA relative target port group id
    pub tag: u16,
    pub enabled: bool,
    /// Addresses of the network portals bound to this TPG
    pub portals: Vec<Ipv4Addr>,
    pub luns: Vec<Lun>,
}

impl Tpg {
    /// True when a network portal on `ip` is bound to this TPG
    pub fn has_portal(&self, ip: Ipv4Addr) -> bool {
        self.portals.contains(&ip)
    }
}

/// A storage object exported as a LUN inside one TPG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lun {
    pub tpg_tag: u16,
    pub lun: u32,
    /// Name of the storage object backing this LUN
    pub storage_object: String,
}

/// A kernel-visible block device, e.g. `core/iblock_3/disk_a`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorageObject {
    pub name: String,
    /// Backstore plugin, e.g. `iblock`
    pub backstore: String,
    /// Kernel-assigned backstore slot (the `3` in `iblock_3`)
    pub slot: u32,
}

impl StorageObject {
    pub fn new(name: impl Into<String>, backstore: impl Into<String>, slot: u32) -> Self {
        Self {
            name: name.into(),
            backstore: backstore.into(),
            slot,
        }
    }

    /// Directory name of the backstore holding this object (`iblock_3`)
    pub fn hba(&self) -> String {
        format!("{}_{}", self.backstore, self.slot)
    }
}

/// ALUA target port group attached to a storage object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AluaGroup {
    pub name: String,
    /// Recorded target port group id; equals the tag of the TPG it was created for
    pub tpg_id: u16,
}

/// Result of [`TargetSubsystem::create_or_get_alua_group`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AluaGroupEntry {
    /// The group did not exist and was created with the requested id
    Created(AluaGroup),
    /// A group of that name already existed; it carries its recorded id
    Existing(AluaGroup),
}

impl AluaGroupEntry {
    pub fn group(&self) -> &AluaGroup {
        match self {
            AluaGroupEntry::Created(group) | AluaGroupEntry::Existing(group) => group,
        }
    }
}

/// ALUA access states (SPC-4 asymmetric access state)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluaAccessState {
    ActiveOptimized = 0,
    ActiveNonOptimized = 1,
}

/// Attributes written to an ALUA group on every bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluaSettings {
    pub access_state: AluaAccessState,
    /// 1 = explicit
    pub access_type: u8,
    pub support_offline: bool,
    pub support_unavailable: bool,
    pub support_standby: bool,
    pub nonop_delay_msecs: u32,
}

impl AluaSettings {
    /// Explicit access, no offline/unavailable/standby support, no delay
    pub fn explicit(access_state: AluaAccessState) -> Self {
        Self {
            access_state,
            access_type: 1,
            support_offline: false,
            support_unavailable: false,
            support_standby: false,
            nonop_delay_msecs: 0,
        }
    }
}

/// Kernel target subsystem capability
///
/// Implement this trait to give the gateway access to a kernel target. Query
/// methods must not have side effects. All TPG operations are addressed by
/// the target IQN and the TPG tag.
pub trait TargetSubsystem {
    /// Check whether a target named `iqn` is registered
    fn target_exists(&self, iqn: &str) -> bool;

    /// Names of every registered iSCSI target
    fn list_targets(&self) -> GatewayResult<Vec<String>>;

    /// Create an empty target
    fn create_target(&mut self, iqn: &str) -> GatewayResult<()>;

    /// Remove a target together with its TPGs, portals and LUNs
    fn delete_target(&mut self, iqn: &str) -> GatewayResult<()>;

    /// Create a new TPG under the target
    ///
    /// # Returns
    /// The tag assigned to the new TPG
    fn create_tpg(&mut self, iqn: &str) -> GatewayResult<u16>;

    /// Snapshot of the target's TPGs, in tag order
    fn tpgs(&self, iqn: &str) -> GatewayResult<Vec<Tpg>>;

    fn set_tpg_enabled(&mut self, iqn: &str, tag: u16, enabled: bool) -> GatewayResult<()>;

    fn set_tpg_attribute(&mut self, iqn: &str, tag: u16, name: &str, value: &str)
        -> GatewayResult<()>;

    /// Bind a network portal listening on `ip` to the TPG
    fn create_network_portal(&mut self, iqn: &str, tag: u16, ip: Ipv4Addr) -> GatewayResult<()>;

    /// Every storage object known to the kernel
    fn storage_objects(&self) -> GatewayResult<Vec<StorageObject>>;

    /// Export `storage_object` as LUN number `lun` of the TPG
    fn create_lun(
        &mut self,
        iqn: &str,
        tag: u16,
        lun: u32,
        storage_object: &StorageObject,
    ) -> GatewayResult<Lun>;

    /// Create the ALUA group `name` on the storage object with id `tpg_id`, or
    /// return the group that already carries that name.
    fn create_or_get_alua_group(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        tpg_id: u16,
    ) -> GatewayResult<AluaGroupEntry>;

    /// Write the access state and support flags of an ALUA group
    fn configure_alua_group(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        settings: &AluaSettings,
    ) -> GatewayResult<()>;

    /// Make `lun` a member of the ALUA group `name`
    fn bind_alua_lun(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        iqn: &str,
        lun: &Lun,
    ) -> GatewayResult<()>;
}
