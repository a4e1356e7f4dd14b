//! Shared gateway configuration record
//!
//! All gateways of a cluster read and write one JSON document:
//!
//! ```json
//! {
//!   "disks":    { "vol1": { "owner": "gw1" } },
//!   "gateways": {
//!     "iqn": "iqn.2003-01.com.example.iscsi-gw:iscsi-igw",
//!     "ip_list": ["10.0.0.1", "10.0.0.2"],
//!     "gw1": { "portal_ip_address": "10.0.0.1", "tpgs": 2, ... }
//!   }
//! }
//! ```
//!
//! A commit replaces the whole document. Sections and keys this crate does
//! not know about are carried through untouched.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const DISKS: &str = "disks";
pub const GATEWAYS: &str = "gateways";

/// Keys of the `gateways` section that are not gateway entries
pub const GATEWAY_IQN: &str = "iqn";
pub const GATEWAY_IP_LIST: &str = "ip_list";

/// Persistent storage for the shared record
pub trait ConfigStore {
    /// Current document text, `None` when nothing was ever committed
    fn read(&self) -> GatewayResult<Option<String>>;

    /// Replace the document
    fn write(&self, contents: &str) -> GatewayResult<()>;
}

/// Record kept in a single JSON file
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn read(&self) -> GatewayResult<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::Config(format!(
                "unable to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write(&self, contents: &str) -> GatewayResult<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, contents)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                GatewayError::Config(format!("unable to write {}: {}", self.path.display(), e))
            })
    }
}

/// Record held in memory
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    contents: RefCell<Option<String>>,
    writes: Cell<usize>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing document
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: RefCell::new(Some(contents.into())),
            writes: Cell::new(0),
        }
    }

    /// Number of commits written so far
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    pub fn contents(&self) -> Option<String> {
        self.contents.borrow().clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read(&self) -> GatewayResult<Option<String>> {
        Ok(self.contents())
    }

    fn write(&self, contents: &str) -> GatewayResult<()> {
        self.contents.replace(Some(contents.to_string()));
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }
}

/// Per-gateway entry of the `gateways` section
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GatewayMetadata {
    pub portal_ip_address: Ipv4Addr,
    pub iqn: String,
    pub active_luns: u32,
    pub tpgs: usize,
    pub inactive_portal_ips: Vec<Ipv4Addr>,
    pub gateway_ip_list: Vec<Ipv4Addr>,
}

#[derive(Deserialize, Debug)]
struct DiskEntry {
    owner: String,
}

#[derive(Deserialize, Debug)]
struct PortalEntry {
    portal_ip_address: Ipv4Addr,
}

/// In-memory copy of the shared record
#[derive(Debug, Clone)]
pub struct Config {
    document: Map<String, Value>,
    changed: bool,
}

impl Config {
    /// Read the record, starting an empty one if the store has none
    pub fn load<S: ConfigStore + ?Sized>(store: &S) -> GatewayResult<Self> {
        let document = match store.read()? {
            Some(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map,
                other => {
                    return Err(GatewayError::Config(format!(
                        "gateway configuration must be a JSON object, found {}",
                        other
                    )))
                }
            },
            None => {
                log::debug!("no gateway configuration found, starting a new one");
                Map::new()
            }
        };
        let mut config = Self {
            document,
            changed: false,
        };
        for section in [DISKS, GATEWAYS] {
            config
                .document
                .entry(section)
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Ok(config)
    }

    /// True when items were added or updated since load/commit
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn section(&self, section: &str) -> Option<&Map<String, Value>> {
        self.document.get(section)?.as_object()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.section(section)?.get(key)
    }

    pub fn contains(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    /// Add `key` to `section`, with `initial` or an empty object as its value
    pub fn add_item(&mut self, section: &str, key: &str, initial: Option<Value>) {
        let value = initial.unwrap_or_else(|| Value::Object(Map::new()));
        self.insert(section, key, value);
    }

    pub fn update_item(&mut self, section: &str, key: &str, value: Value) {
        self.insert(section, key, value);
    }

    fn insert(&mut self, section: &str, key: &str, value: Value) {
        let entry = self
            .document
            .entry(section)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
        self.changed = true;
    }

    /// Typed view of a gateway entry
    pub fn gateway(&self, node: &str) -> GatewayResult<Option<GatewayMetadata>> {
        self.get(GATEWAYS, node)
            .map(|value| GatewayMetadata::deserialize(value))
            .transpose()
            .map_err(|e| GatewayError::Config(format!("gateway entry '{}': {}", node, e)))
    }

    /// Node that owns the optimized path of `disk`
    pub fn disk_owner(&self, disk: &str) -> GatewayResult<String> {
        let value = self
            .get(DISKS, disk)
            .ok_or_else(|| GatewayError::Config(format!("disk '{}' is not defined", disk)))?;
        let entry = DiskEntry::deserialize(value)
            .map_err(|e| GatewayError::Config(format!("disk entry '{}': {}", disk, e)))?;
        Ok(entry.owner)
    }

    /// Active portal address recorded for `node`
    pub fn portal_ip(&self, node: &str) -> GatewayResult<Ipv4Addr> {
        let value = self
            .get(GATEWAYS, node)
            .ok_or_else(|| GatewayError::Config(format!("gateway '{}' is not defined", node)))?;
        let entry = PortalEntry::deserialize(value)
            .map_err(|e| GatewayError::Config(format!("gateway entry '{}': {}", node, e)))?;
        Ok(entry.portal_ip_address)
    }

    /// Write the whole record back to the store
    pub fn commit<S: ConfigStore + ?Sized>(&mut self, store: &S) -> GatewayResult<()> {
        let text = serde_json::to_string_pretty(&self.document)?;
        store.write(&text)?;
        self.changed = false;
        log::info!("gateway configuration committed");
        Ok(())
    }
}
