//! Error types for gateway reconciliation

use std::net::Ipv4Addr;
use thiserror::Error;

/// Gateway reconciliation errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// None of the cluster portal addresses is bound to a local interface
    #[error("gateway IP addresses {0:?} do not match any ip on this host")]
    NoMatchingAddress(Vec<Ipv4Addr>),

    /// A create/bind/query against the kernel target subsystem failed
    #[error("kernel object error: {0}")]
    KernelObject(String),

    /// An existing ALUA group is recorded against a different TPG tag
    #[error(
        "ALUA group '{group}' of storage object '{storage_object}' is bound to tpg {recorded}, \
         but the lun is on tpg {current}; owner/port topology changes are not supported"
    )]
    TopologyMismatch {
        storage_object: String,
        group: String,
        recorded: u16,
        current: u16,
    },

    /// The shared gateway configuration record could not be read or committed
    #[error("configuration error: {0}")]
    Config(String),

    /// Map mode was requested before the target was defined
    #[error("Attempted to map to a gateway '{0}' that hasn't been defined yet...out of order steps?")]
    NotYetDefined(String),

    /// Local node settings are invalid
    #[error("settings error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host lookup (interfaces, hostname) failed
    #[error("host error: {0}")]
    Host(#[from] nix::Error),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(e: toml::de::Error) -> Self {
        GatewayError::Settings(e.to_string())
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Shorthand for building a [`GatewayError::KernelObject`]
pub(crate) fn kernel_error(msg: impl Into<String>) -> GatewayError {
    GatewayError::KernelObject(msg.into())
}
