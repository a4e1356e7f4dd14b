//! Active portal selection
//!
//! Every gateway is handed the same ordered list of cluster portal addresses.
//! Exactly one of them is expected to be bound to an interface on this host;
//! that one becomes the active portal.

use crate::error::{GatewayError, GatewayResult};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Pick the active portal address for this node.
///
/// Returns the first address of `gateway_ip_list` (in list order) that is also
/// present in `local`. More than one match is a misconfiguration; the choice is
/// still deterministic but a warning is logged.
pub fn match_active_portal(
    gateway_ip_list: &[Ipv4Addr],
    local: &BTreeSet<Ipv4Addr>,
) -> GatewayResult<Ipv4Addr> {
    let mut matching = gateway_ip_list.iter().filter(|ip| local.contains(ip));

    let active = *matching
        .next()
        .ok_or_else(|| GatewayError::NoMatchingAddress(gateway_ip_list.to_vec()))?;

    let others: Vec<&Ipv4Addr> = matching.collect();
    if !others.is_empty() {
        log::warn!(
            "more than one gateway IP is local to this host ({} and {:?}), using {}",
            active,
            others,
            active
        );
    }

    log::debug!("active portal will use {}", active);
    Ok(active)
}

/// IPv4 addresses currently bound to this host's interfaces
pub fn local_ipv4_addresses() -> GatewayResult<BTreeSet<Ipv4Addr>> {
    let addrs = nix::ifaddrs::getifaddrs()?
        .filter_map(|ifaddr| {
            ifaddr
                .address
                .as_ref()
                .and_then(|addr| addr.as_sockaddr_in())
                .map(|sin| sin.ip())
        })
        .collect();
    Ok(addrs)
}
