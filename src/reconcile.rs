//! TPG to portal reconciliation
//!
//! TPG numbers must map to the same portal address on every gateway. The
//! portal list is walked in cluster order and each address is paired with
//! the first unclaimed TPG that exposes it. Whatever is left over has to be
//! created, in list order, so new portals are always appended after the
//! existing TPGs.

use crate::kernel::Tpg;
use std::net::Ipv4Addr;

/// Outcome of pairing required portals with existing TPGs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalPlan {
    /// Portals already served, with the tag of the TPG serving them
    pub matched: Vec<(Ipv4Addr, u16)>,
    /// Portals that need a new TPG, in cluster order
    pub missing: Vec<Ipv4Addr>,
}

impl PortalPlan {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Pair each required portal with at most one existing TPG.
///
/// Matching is one-to-one: a TPG claimed by one address is not offered to
/// later ones, and a repeated address needs a TPG of its own.
pub fn plan_portals(existing: &[Tpg], required: &[Ipv4Addr]) -> PortalPlan {
    let mut claimed = vec![false; existing.len()];
    let mut plan = PortalPlan::default();

    for &ip in required {
        let found = existing
            .iter()
            .enumerate()
            .find(|(i, tpg)| !claimed[*i] && tpg.has_portal(ip));
        match found {
            Some((i, tpg)) => {
                claimed[i] = true;
                plan.matched.push((ip, tpg.tag));
            }
            None => plan.missing.push(ip),
        }
    }

    plan
}
