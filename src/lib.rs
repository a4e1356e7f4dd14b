//! iSCSI gateway reconciliation
//!
//! A cluster of gateway nodes exports the same block devices through one
//! iSCSI target. Each node reconciles its kernel target (LIO) with the
//! cluster's shared configuration record: one TPG per cluster portal, in the
//! same order on every node, only the local portal's TPG enabled, every disk
//! mapped into every TPG, and ALUA path states telling initiators which
//! gateway owns the optimized path of each disk.
//!
//! The kernel is reached through the [`TargetSubsystem`] trait and the shared
//! record through [`ConfigStore`], so both can be swapped out.
//!
//! # Example
//!
//! ```
//! use iscsi_gateway::{Gateway, MemoryConfigStore, MemoryKernel, Mode};
//! use std::net::Ipv4Addr;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let portals = ["10.0.0.1".parse::<Ipv4Addr>()?, "10.0.0.2".parse::<Ipv4Addr>()?];
//! let store = MemoryConfigStore::new();
//!
//! let mut gateway = Gateway::<MemoryKernel>::builder()
//!     .iqn("iqn.2003-01.com.example.iscsi-gw:iscsi-igw")
//!     .gateway_ip_list(&portals)
//!     .local_addresses([portals[0]])
//!     .node_name("gw1")
//!     .build(MemoryKernel::new())?;
//!
//! gateway.manage(Mode::Target, &store);
//! assert!(!gateway.has_error(), "{}", gateway.error_msg());
//! assert_eq!(gateway.tpgs().len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod alua;
pub mod config;
pub mod configfs;
pub mod error;
pub mod kernel;
pub mod lun;
pub mod manage;
pub mod membership;
pub mod memory;
pub mod reconcile;
pub mod settings;
pub mod target;

pub use config::{Config, ConfigStore, FileConfigStore, GatewayMetadata, MemoryConfigStore};
pub use configfs::ConfigFs;
pub use error::{GatewayError, GatewayResult};
pub use kernel::{AluaAccessState, Lun, StorageObject, TargetSubsystem, Tpg};
pub use manage::Mode;
pub use memory::MemoryKernel;
pub use settings::GatewaySettings;
pub use target::{Gateway, GatewayBuilder};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
