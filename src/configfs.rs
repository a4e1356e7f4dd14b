//! LIO configfs backend
//!
//! Maps [`TargetSubsystem`] onto the directory tree the LIO target exposes
//! under `/sys/kernel/config/target`:
//!
//! ```text
//! iscsi/<iqn>/tpgt_<tag>/enable
//! iscsi/<iqn>/tpgt_<tag>/attrib/<name>
//! iscsi/<iqn>/tpgt_<tag>/np/<ip>:3260/
//! iscsi/<iqn>/tpgt_<tag>/lun/lun_<n>/<link to core/<hba>/<name>>
//! iscsi/<iqn>/tpgt_<tag>/lun/lun_<n>/alua_tg_pt_gp
//! core/<backstore>_<slot>/<name>/alua/<group>/tg_pt_gp_id
//! ```
//!
//! The root is configurable so the same code runs against a scratch
//! directory.

use crate::error::{kernel_error, GatewayError, GatewayResult};
use crate::kernel::{
    AluaGroup, AluaGroupEntry, AluaSettings, Lun, StorageObject, TargetSubsystem, Tpg, ISCSI_PORT,
};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Default mount point of the LIO configfs tree
pub const DEFAULT_CONFIGFS_ROOT: &str = "/sys/kernel/config/target";

fn io_error(path: &Path, e: io::Error) -> GatewayError {
    kernel_error(format!("{}: {}", path.display(), e))
}

fn write_attr(path: &Path, value: &str) -> GatewayResult<()> {
    fs::write(path, value).map_err(|e| io_error(path, e))
}

fn read_attr(path: &Path) -> GatewayResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| io_error(path, e))
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Entries of a directory, empty when the directory does not exist
fn entries(path: &Path) -> GatewayResult<Vec<fs::DirEntry>> {
    match fs::read_dir(path) {
        Ok(dir) => dir
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| io_error(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_error(path, e)),
    }
}

/// Parse `<prefix><number>` directory names such as `tpgt_3` or `lun_0`
fn numbered<T: std::str::FromStr>(name: &str, prefix: &str) -> Option<T> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Remove a configfs directory.
///
/// On configfs, attribute files and default groups vanish with their parent
/// and refuse individual removal, so only the final `rmdir` is checked.
/// Symlinks (LUN to storage object links) must be removed first.
fn remove_tree(path: &Path) -> io::Result<()> {
    if let Ok(dir) = fs::read_dir(path) {
        for entry in dir.flatten() {
            let child = entry.path();
            match fs::symlink_metadata(&child) {
                Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&child)?,
                Ok(meta) if meta.is_dir() => {
                    let _ = remove_tree(&child);
                }
                _ => {
                    let _ = fs::remove_file(&child);
                }
            }
        }
    }
    fs::remove_dir(path)
}

/// Kernel target subsystem backed by a configfs tree
#[derive(Debug, Clone)]
pub struct ConfigFs {
    root: PathBuf,
}

impl Default for ConfigFs {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIGFS_ROOT)
    }
}

impl ConfigFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_path(&self, iqn: &str) -> PathBuf {
        self.root.join("iscsi").join(iqn)
    }

    fn tpg_path(&self, iqn: &str, tag: u16) -> PathBuf {
        self.target_path(iqn).join(format!("tpgt_{}", tag))
    }

    fn lun_path(&self, iqn: &str, tag: u16, lun: u32) -> PathBuf {
        self.tpg_path(iqn, tag).join("lun").join(format!("lun_{}", lun))
    }

    fn storage_object_path(&self, storage_object: &StorageObject) -> PathBuf {
        self.root
            .join("core")
            .join(storage_object.hba())
            .join(&storage_object.name)
    }

    fn alua_path(&self, storage_object: &StorageObject, name: &str) -> PathBuf {
        self.storage_object_path(storage_object).join("alua").join(name)
    }

    fn tpg_tags(&self, iqn: &str) -> GatewayResult<Vec<u16>> {
        let mut tags: Vec<u16> = entries(&self.target_path(iqn))?
            .iter()
            .filter_map(|entry| numbered(&entry.file_name().to_string_lossy(), "tpgt_"))
            .collect();
        tags.sort_unstable();
        Ok(tags)
    }

    fn read_tpg(&self, iqn: &str, tag: u16) -> GatewayResult<Tpg> {
        let path = self.tpg_path(iqn, tag);

        let enable = path.join("enable");
        let enabled = enable.exists() && read_attr(&enable)? == "1";

        let mut portals: Vec<Ipv4Addr> = entries(&path.join("np"))?
            .iter()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let (ip, _port) = name.rsplit_once(':')?;
                ip.parse().ok()
            })
            .collect();
        portals.sort_unstable();

        let mut luns = Vec::new();
        for entry in entries(&path.join("lun"))? {
            let Some(lun) = numbered::<u32>(&entry.file_name().to_string_lossy(), "lun_") else {
                continue;
            };
            if let Some(storage_object) = self.linked_storage_object(&entry.path())? {
                luns.push(Lun {
                    tpg_tag: tag,
                    lun,
                    storage_object,
                });
            }
        }
        luns.sort_by_key(|l| l.lun);

        Ok(Tpg {
            tag,
            enabled,
            portals,
            luns,
        })
    }

    /// Name of the storage object a LUN directory links to
    fn linked_storage_object(&self, lun_dir: &Path) -> GatewayResult<Option<String>> {
        for entry in entries(lun_dir)? {
            let path = entry.path();
            let meta = fs::symlink_metadata(&path).map_err(|e| io_error(&path, e))?;
            if meta.file_type().is_symlink() {
                let dest = fs::read_link(&path).map_err(|e| io_error(&path, e))?;
                return Ok(dest
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }
}

impl TargetSubsystem for ConfigFs {
    fn target_exists(&self, iqn: &str) -> bool {
        self.target_path(iqn).is_dir()
    }

    fn list_targets(&self) -> GatewayResult<Vec<String>> {
        let mut targets: Vec<String> = entries(&self.root.join("iscsi"))?
            .iter()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("iqn."))
            .collect();
        targets.sort();
        Ok(targets)
    }

    fn create_target(&mut self, iqn: &str) -> GatewayResult<()> {
        let fabric = self.root.join("iscsi");
        fs::create_dir_all(&fabric).map_err(|e| io_error(&fabric, e))?;
        let path = self.target_path(iqn);
        fs::create_dir(&path).map_err(|e| io_error(&path, e))?;
        log::debug!("created {}", path.display());
        Ok(())
    }

    fn delete_target(&mut self, iqn: &str) -> GatewayResult<()> {
        let path = self.target_path(iqn);
        for tag in self.tpg_tags(iqn)? {
            let tpg = self.tpg_path(iqn, tag);
            remove_tree(&tpg).map_err(|e| io_error(&tpg, e))?;
        }
        remove_tree(&path).map_err(|e| io_error(&path, e))
    }

    fn create_tpg(&mut self, iqn: &str) -> GatewayResult<u16> {
        if !self.target_exists(iqn) {
            return Err(kernel_error(format!("target {} does not exist", iqn)));
        }
        // LIO does not accept tpgt_0
        let tag = self.tpg_tags(iqn)?.last().map_or(1, |last| last + 1);
        let path = self.tpg_path(iqn, tag);
        fs::create_dir(&path).map_err(|e| io_error(&path, e))?;
        Ok(tag)
    }

    fn tpgs(&self, iqn: &str) -> GatewayResult<Vec<Tpg>> {
        if !self.target_exists(iqn) {
            return Err(kernel_error(format!("target {} does not exist", iqn)));
        }
        self.tpg_tags(iqn)?
            .into_iter()
            .map(|tag| self.read_tpg(iqn, tag))
            .collect()
    }

    fn set_tpg_enabled(&mut self, iqn: &str, tag: u16, enabled: bool) -> GatewayResult<()> {
        write_attr(&self.tpg_path(iqn, tag).join("enable"), flag(enabled))
    }

    fn set_tpg_attribute(
        &mut self,
        iqn: &str,
        tag: u16,
        name: &str,
        value: &str,
    ) -> GatewayResult<()> {
        let attrib = self.tpg_path(iqn, tag).join("attrib");
        fs::create_dir_all(&attrib).map_err(|e| io_error(&attrib, e))?;
        write_attr(&attrib.join(name), value)
    }

    fn create_network_portal(&mut self, iqn: &str, tag: u16, ip: Ipv4Addr) -> GatewayResult<()> {
        let np = self.tpg_path(iqn, tag).join("np");
        fs::create_dir_all(&np).map_err(|e| io_error(&np, e))?;
        let path = np.join(format!("{}:{}", ip, ISCSI_PORT));
        fs::create_dir(&path).map_err(|e| io_error(&path, e))
    }

    fn storage_objects(&self) -> GatewayResult<Vec<StorageObject>> {
        let mut objects = Vec::new();
        for hba in entries(&self.root.join("core"))? {
            let hba_name = hba.file_name().to_string_lossy().into_owned();
            let Some((backstore, slot)) = hba_name.rsplit_once('_') else {
                continue;
            };
            let Ok(slot) = slot.parse::<u32>() else {
                continue;
            };
            for entry in entries(&hba.path())? {
                if entry.path().is_dir() {
                    objects.push(StorageObject::new(
                        entry.file_name().to_string_lossy(),
                        backstore,
                        slot,
                    ));
                }
            }
        }
        objects.sort();
        Ok(objects)
    }

    fn create_lun(
        &mut self,
        iqn: &str,
        tag: u16,
        lun: u32,
        storage_object: &StorageObject,
    ) -> GatewayResult<Lun> {
        let source = self.storage_object_path(storage_object);
        if !source.is_dir() {
            return Err(kernel_error(format!(
                "storage object {} does not exist",
                source.display()
            )));
        }
        let path = self.lun_path(iqn, tag, lun);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        fs::create_dir(&path).map_err(|e| io_error(&path, e))?;
        let link = path.join(&storage_object.name);
        std::os::unix::fs::symlink(&source, &link).map_err(|e| io_error(&link, e))?;
        Ok(Lun {
            tpg_tag: tag,
            lun,
            storage_object: storage_object.name.clone(),
        })
    }

    fn create_or_get_alua_group(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        tpg_id: u16,
    ) -> GatewayResult<AluaGroupEntry> {
        let path = self.alua_path(storage_object, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let id_path = path.join("tg_pt_gp_id");
        match fs::create_dir(&path) {
            Ok(()) => {
                write_attr(&id_path, &tpg_id.to_string())?;
                Ok(AluaGroupEntry::Created(AluaGroup {
                    name: name.to_string(),
                    tpg_id,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let recorded = read_attr(&id_path)?;
                let recorded = recorded.parse().map_err(|_| {
                    kernel_error(format!(
                        "{}: invalid group id '{}'",
                        id_path.display(),
                        recorded
                    ))
                })?;
                Ok(AluaGroupEntry::Existing(AluaGroup {
                    name: name.to_string(),
                    tpg_id: recorded,
                }))
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn configure_alua_group(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        settings: &AluaSettings,
    ) -> GatewayResult<()> {
        let path = self.alua_path(storage_object, name);
        write_attr(
            &path.join("alua_access_state"),
            &(settings.access_state as u8).to_string(),
        )?;
        write_attr(
            &path.join("alua_access_type"),
            &settings.access_type.to_string(),
        )?;
        write_attr(
            &path.join("alua_support_offline"),
            flag(settings.support_offline),
        )?;
        write_attr(
            &path.join("alua_support_unavailable"),
            flag(settings.support_unavailable),
        )?;
        write_attr(
            &path.join("alua_support_standby"),
            flag(settings.support_standby),
        )?;
        write_attr(
            &path.join("nonop_delay_msecs"),
            &settings.nonop_delay_msecs.to_string(),
        )
    }

    fn bind_alua_lun(
        &mut self,
        storage_object: &StorageObject,
        name: &str,
        iqn: &str,
        lun: &Lun,
    ) -> GatewayResult<()> {
        if !self.alua_path(storage_object, name).is_dir() {
            return Err(kernel_error(format!("alua group {} does not exist", name)));
        }
        write_attr(
            &self
                .lun_path(iqn, lun.tpg_tag, lun.lun)
                .join("alua_tg_pt_gp"),
            name,
        )
    }
}
