//! End-to-end reconciliation tests
//!
//! These drive `Gateway::manage` the way a deployment driver would, against
//! the in-memory kernel and an in-memory shared record. They cover:
//! - Target definition and the gateway's record entry
//! - Idempotent re-runs and portal list growth
//! - LUN mapping and ALUA path states
//! - Error capture and rollback
//! - Several gateways sharing one record

use iscsi_gateway::config::{DISKS, GATEWAYS};
use iscsi_gateway::kernel::SENDTARGETS_ATTRIBUTE;
use iscsi_gateway::{
    Config, ConfigStore, Gateway, GatewayError, MemoryConfigStore, MemoryKernel, Mode,
    StorageObject, TargetSubsystem,
};
use serde_json::json;
use std::net::Ipv4Addr;

const IQN: &str = "iqn.2003-01.com.example.iscsi-gw:iscsi-igw";

// ============================================================================
// Helpers
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn ips(list: &[&str]) -> Vec<Ipv4Addr> {
    list.iter().map(|s| ip(s)).collect()
}

/// Gateway `node` whose only local address is `local`
fn gateway(
    kernel: MemoryKernel,
    node: &str,
    portals: &[&str],
    local: &str,
) -> Gateway<MemoryKernel> {
    Gateway::<MemoryKernel>::builder()
        .iqn(IQN)
        .gateway_ip_list(&ips(portals))
        .local_addresses([ip(local), ip("127.0.0.1")])
        .node_name(node)
        .build(kernel)
        .unwrap_or_else(|e| panic!("failed to build gateway {}: {}", node, e))
}

fn assert_ok(gw: &Gateway<MemoryKernel>) {
    assert!(
        !gw.has_error(),
        "gateway {} reported an error: {}",
        gw.node_name(),
        gw.error_msg()
    );
}

/// Record disk ownership, as the disk provisioning step does
fn set_owner(store: &MemoryConfigStore, disk: &str, owner: &str) {
    let mut config = Config::load(store).unwrap();
    config.update_item(DISKS, disk, json!({ "owner": owner }));
    config.commit(store).unwrap();
}

fn record(store: &MemoryConfigStore) -> serde_json::Value {
    serde_json::from_str(&store.read().unwrap().unwrap()).unwrap()
}

// ============================================================================
// Target mode
// ============================================================================

#[test]
fn test_target_on_fresh_kernel() {
    init_logging();
    let store = MemoryConfigStore::new();
    let mut gw = gateway(MemoryKernel::new(), "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");

    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    assert!(gw.changes_made());
    assert!(gw.config_updated());

    let kernel = gw.kernel();
    assert!(kernel.target_exists(IQN));
    let tpgs = kernel.tpgs(IQN).unwrap();
    assert_eq!(tpgs.len(), 2);

    assert_eq!(tpgs[0].tag, 0);
    assert!(tpgs[0].enabled);
    assert_eq!(tpgs[0].portals, ips(&["10.0.0.1"]));

    assert_eq!(tpgs[1].tag, 1);
    assert!(!tpgs[1].enabled);
    assert_eq!(tpgs[1].portals, ips(&["10.0.0.2"]));
    assert_eq!(kernel.tpg_attribute(IQN, 1, SENDTARGETS_ATTRIBUTE), Some("0"));

    let doc = record(&store);
    assert_eq!(doc["gateways"]["iqn"], json!(IQN));
    assert_eq!(doc["gateways"]["ip_list"], json!(["10.0.0.1", "10.0.0.2"]));
    assert_eq!(doc["gateways"]["gw1"]["tpgs"], json!(2));
    assert_eq!(doc["gateways"]["gw1"]["active_luns"], json!(0));
    assert_eq!(doc["gateways"]["gw1"]["portal_ip_address"], json!("10.0.0.1"));
    assert_eq!(doc["gateways"]["gw1"]["inactive_portal_ips"], json!(["10.0.0.2"]));
    assert_eq!(store.writes(), 1);
}

#[test]
fn test_target_rerun_is_noop() {
    init_logging();
    let store = MemoryConfigStore::new();
    let mut gw = gateway(MemoryKernel::new(), "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    let created = gw.kernel().creations();

    let mut gw = gateway(gw.into_kernel(), "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    assert_eq!(gw.kernel().creations(), created);
    assert!(!gw.changes_made());
    assert!(!gw.config_updated());
    assert_eq!(store.writes(), 1, "an unchanged record must not be rewritten");
    assert_eq!(gw.tpgs().len(), 2);
}

#[test]
fn test_added_portal_is_appended() {
    init_logging();
    let store = MemoryConfigStore::new();
    let three = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
    let mut gw = gateway(MemoryKernel::new(), "gw1", &three, "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    let before: Vec<(u16, Vec<Ipv4Addr>)> = gw
        .kernel()
        .tpgs(IQN)
        .unwrap()
        .into_iter()
        .map(|t| (t.tag, t.portals))
        .collect();

    let four = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];
    let mut gw = gateway(gw.into_kernel(), "gw1", &four, "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);

    let after = gw.kernel().tpgs(IQN).unwrap();
    assert_eq!(after.len(), 4);
    for (tag, portals) in &before {
        let tpg = after.iter().find(|t| t.tag == *tag).unwrap();
        assert_eq!(&tpg.portals, portals, "tpg {} changed portals", tag);
    }
    assert_eq!(after[3].tag, 3);
    assert_eq!(after[3].portals, ips(&["10.0.0.4"]));
    assert!(!after[3].enabled);

    let doc = record(&store);
    assert_eq!(doc["gateways"]["gw1"]["tpgs"], json!(4));
    assert_eq!(
        doc["gateways"]["gw1"]["inactive_portal_ips"],
        json!(["10.0.0.2", "10.0.0.3", "10.0.0.4"])
    );
    // first writer wins on the global list
    assert_eq!(doc["gateways"]["ip_list"], json!(three));
    assert_eq!(store.writes(), 2);
}

#[test]
fn test_failed_tpg_rolls_back() {
    init_logging();
    let store = MemoryConfigStore::new();
    let mut kernel = MemoryKernel::new();
    kernel.fail_portal(ip("10.0.0.2"));
    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");

    gw.manage(Mode::Target, &store);
    assert!(matches!(gw.error(), Some(GatewayError::KernelObject(_))));
    assert!(!gw.kernel().target_exists(IQN));
    assert!(!gw.changes_made());
    assert_eq!(store.writes(), 0);

    // a clean retry starts from scratch
    let mut kernel = gw.into_kernel();
    kernel.clear_failures();
    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    let tags: Vec<u16> = gw.kernel().tpgs(IQN).unwrap().iter().map(|t| t.tag).collect();
    assert_eq!(tags, vec![0, 1]);
}

#[test]
fn test_unreadable_record_stops_before_kernel() {
    init_logging();
    let store = MemoryConfigStore::with_contents("not json");
    let mut gw = gateway(MemoryKernel::new(), "gw1", &["10.0.0.1"], "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert!(matches!(gw.error(), Some(GatewayError::Config(_))));
    assert_eq!(gw.kernel().creations(), 0);
}

#[test]
fn test_foreign_portal_list_is_rejected() {
    let err = Gateway::<MemoryKernel>::builder()
        .iqn(IQN)
        .gateway_ip_list(&ips(&["10.0.0.1", "10.0.0.2"]))
        .local_addresses([ip("192.168.0.10")])
        .node_name("gw9")
        .build(MemoryKernel::new())
        .unwrap_err();
    assert!(matches!(err, GatewayError::NoMatchingAddress(_)));
    assert!(err.to_string().contains("do not match any ip on this host"));
}

// ============================================================================
// Map mode
// ============================================================================

/// Kernel and record after a successful target run on gw1, with `disks`
/// provisioned and owned by `owner`.
fn defined_gateway(disks: &[(&str, u32)], owner: &str) -> (MemoryKernel, MemoryConfigStore) {
    let store = MemoryConfigStore::new();
    let mut kernel = MemoryKernel::new();
    for (name, slot) in disks {
        kernel.add_storage_object(StorageObject::new(*name, "iblock", *slot));
    }
    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    for (name, _) in disks {
        set_owner(&store, name, owner);
    }
    (gw.into_kernel(), store)
}

#[test]
fn test_map_before_target_is_out_of_order() {
    init_logging();
    let store = MemoryConfigStore::new();
    let mut gw = gateway(MemoryKernel::new(), "gw1", &["10.0.0.1"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert!(matches!(gw.error(), Some(GatewayError::NotYetDefined(_))));
    assert!(gw.error_msg().contains("out of order steps"));
    assert_eq!(gw.kernel().creations(), 0);
}

#[test]
fn test_map_owned_volume() {
    init_logging();
    let (kernel, store) = defined_gateway(&[("vol1", 0)], "gw1");

    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert_ok(&gw);
    assert!(gw.changes_made());

    let kernel = gw.kernel();
    let tpgs = kernel.tpgs(IQN).unwrap();
    for tpg in &tpgs {
        assert_eq!(tpg.luns.len(), 1);
        assert_eq!(tpg.luns[0].lun, 0);
        assert_eq!(tpg.luns[0].storage_object, "vol1");
    }

    let ao = kernel.alua_group("vol1", "ao").unwrap();
    assert_eq!(ao.group.tpg_id, 0);
    assert_eq!(ao.settings.unwrap().access_state as u8, 0);
    assert_eq!(ao.members, vec![(IQN.to_string(), 0, 0)]);

    let ano = kernel.alua_group("vol1", "ano1").unwrap();
    assert_eq!(ano.group.tpg_id, 1);
    assert_eq!(ano.settings.unwrap().access_state as u8, 1);
    assert_eq!(ano.members, vec![(IQN.to_string(), 1, 0)]);
}

#[test]
fn test_map_is_deterministic_and_idempotent() {
    init_logging();
    let (kernel, store) = defined_gateway(&[("vol_a", 4), ("vol_b", 2)], "gw1");

    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert_ok(&gw);
    let first = gw.kernel().tpgs(IQN).unwrap();
    let created = gw.kernel().creations();

    let mut gw = gateway(gw.into_kernel(), "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert_ok(&gw);
    assert!(!gw.changes_made());
    assert_eq!(gw.kernel().creations(), created);
    assert_eq!(gw.kernel().tpgs(IQN).unwrap(), first);

    let lun_of = |name: &str| {
        first[0]
            .luns
            .iter()
            .find(|l| l.storage_object == name)
            .map(|l| l.lun)
    };
    assert_eq!(lun_of("vol_a"), Some(4));
    assert_eq!(lun_of("vol_b"), Some(2));
}

#[test]
fn test_map_failure_skips_rest_of_tpg_only() {
    init_logging();
    let (mut kernel, store) =
        defined_gateway(&[("vol1", 0), ("vol2", 1), ("volx", 5)], "gw1");
    // LUN 0 of tpg 0 is taken by another disk, so vol1 cannot be mapped there
    let volx = StorageObject::new("volx", "iblock", 5);
    kernel.create_lun(IQN, 0, 0, &volx).unwrap();

    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert!(matches!(gw.error(), Some(GatewayError::KernelObject(_))));

    let tpgs = gw.kernel().tpgs(IQN).unwrap();
    let names = |i: usize| -> Vec<String> {
        tpgs[i]
            .luns
            .iter()
            .map(|l| l.storage_object.clone())
            .collect()
    };
    // vol2 came after the failure on tpg 0 and was skipped there
    assert_eq!(names(0), vec!["volx".to_string()]);
    // tpg 1 was still mapped in full
    assert_eq!(names(1).len(), 3);
}

#[test]
fn test_map_stops_on_topology_mismatch() {
    init_logging();
    let (mut kernel, store) = defined_gateway(&[("vol1", 0)], "gw1");
    // an "ao" group left over from a layout where the owner sat on tpg 9
    let vol1 = StorageObject::new("vol1", "iblock", 0);
    kernel.create_or_get_alua_group(&vol1, "ao", 9).unwrap();

    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    match gw.error() {
        Some(GatewayError::TopologyMismatch {
            recorded, current, ..
        }) => {
            assert_eq!(*recorded, 9);
            assert_eq!(*current, 0);
        }
        other => panic!("expected TopologyMismatch, got {:?}", other),
    }
    // the pass stopped before reaching tpg 1
    assert!(gw.kernel().tpgs(IQN).unwrap()[1].luns.is_empty());
}

#[test]
fn test_map_without_owner_is_config_error() {
    init_logging();
    let (mut kernel, store) = defined_gateway(&[], "gw1");
    kernel.add_storage_object(StorageObject::new("orphan", "iblock", 3));

    let mut gw = gateway(kernel, "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert!(matches!(gw.error(), Some(GatewayError::Config(_))));
}

#[test]
fn test_late_portal_binds_alua() {
    init_logging();
    let store = MemoryConfigStore::new();
    let mut kernel = MemoryKernel::new();
    kernel.add_storage_object(StorageObject::new("vol1", "iblock", 0));
    let mut gw = Gateway::<MemoryKernel>::builder()
        .iqn(IQN)
        .gateway_ip_list(&ips(&["10.0.0.1", "10.0.0.2"]))
        .local_addresses([ip("10.0.0.1")])
        .node_name("gw1")
        .enable_portal(false)
        .build(kernel)
        .unwrap();
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    set_owner(&store, "vol1", "gw1");

    let mut gw = gateway(gw.into_kernel(), "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert_ok(&gw);
    // the enabled tpg has no portal yet, so only the other path got a group
    assert!(gw.kernel().alua_group("vol1", "ao").is_none());
    assert!(gw.kernel().alua_group("vol1", "ano1").is_some());

    let config = Config::load(&store).unwrap();
    gw.enable_active_tpg(&config);
    assert_ok(&gw);
    let tpgs = gw.kernel().tpgs(IQN).unwrap();
    assert_eq!(tpgs[0].portals, ips(&["10.0.0.1"]));
    let ao = gw.kernel().alua_group("vol1", "ao").unwrap();
    assert_eq!(ao.members, vec![(IQN.to_string(), 0, 0)]);
}

#[test]
fn test_enable_active_tpg_twice() {
    init_logging();
    let store = MemoryConfigStore::new();
    let mut kernel = MemoryKernel::new();
    kernel.add_storage_object(StorageObject::new("vol1", "iblock", 0));
    let mut gw = Gateway::<MemoryKernel>::builder()
        .iqn(IQN)
        .gateway_ip_list(&ips(&["10.0.0.1", "10.0.0.2"]))
        .local_addresses([ip("10.0.0.1")])
        .node_name("gw1")
        .enable_portal(false)
        .build(kernel)
        .unwrap();
    gw.manage(Mode::Target, &store);
    assert_ok(&gw);
    set_owner(&store, "vol1", "gw1");
    let config = Config::load(&store).unwrap();
    gw.enable_active_tpg(&config);
    assert_ok(&gw);

    // after a restart the portal is already bound
    let mut gw = gateway(gw.into_kernel(), "gw1", &["10.0.0.1", "10.0.0.2"], "10.0.0.1");
    gw.manage(Mode::Map, &store);
    assert_ok(&gw);
    gw.enable_active_tpg(&config);
    assert_ok(&gw);
    let tpgs = gw.kernel().tpgs(IQN).unwrap();
    assert_eq!(tpgs[0].portals, ips(&["10.0.0.1"]));
    let ao = gw.kernel().alua_group("vol1", "ao").unwrap();
    assert_eq!(ao.members, vec![(IQN.to_string(), 0, 0)]);
}

// ============================================================================
// Several gateways
// ============================================================================

#[test]
fn test_two_gateways_agree() {
    init_logging();
    let store = MemoryConfigStore::new();
    let portals = ["10.0.0.1", "10.0.0.2"];
    let vol1 = StorageObject::new("vol1", "iblock", 0);

    let mut kernels = Vec::new();
    for (node, local) in [("gw1", "10.0.0.1"), ("gw2", "10.0.0.2")] {
        let mut kernel = MemoryKernel::new();
        kernel.add_storage_object(vol1.clone());
        let mut gw = gateway(kernel, node, &portals, local);
        gw.manage(Mode::Target, &store);
        assert_ok(&gw);
        kernels.push((node, local, gw.into_kernel()));
    }

    let config = Config::load(&store).unwrap();
    let gateways = config.section(GATEWAYS).unwrap();
    assert!(gateways.contains_key("gw1"));
    assert!(gateways.contains_key("gw2"));
    assert_eq!(
        config.gateway("gw2").unwrap().unwrap().inactive_portal_ips,
        ips(&["10.0.0.1"])
    );
    set_owner(&store, "vol1", "gw1");

    for (node, local, kernel) in kernels {
        let mut gw = gateway(kernel, node, &portals, local);
        gw.manage(Mode::Map, &store);
        assert_ok(&gw);

        let kernel = gw.kernel();
        let tpgs = kernel.tpgs(IQN).unwrap();
        // same tag for the same portal on every node
        assert_eq!(tpgs[0].portals, ips(&["10.0.0.1"]));
        assert_eq!(tpgs[1].portals, ips(&["10.0.0.2"]));
        assert_eq!(tpgs[0].enabled, node == "gw1");
        assert_eq!(tpgs[1].enabled, node == "gw2");

        // the owner's portal is the optimized path everywhere
        assert_eq!(kernel.alua_group("vol1", "ao").unwrap().group.tpg_id, 0);
        assert_eq!(kernel.alua_group("vol1", "ano1").unwrap().group.tpg_id, 1);
    }
}
