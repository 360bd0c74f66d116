mod common;

use common::FakeDevice;
use std::net::Ipv4Addr;
use std::path::Path;
use wg_gateway::allocator::IpAllocator;
use wg_gateway::lifecycle::{InterfaceManager, InterfaceSettings, LifecycleState};
use wg_gateway::peer_registry::{FileRegistry, NewPeer, PeerRegistry, PeerStatus};
use wg_gateway::subnet::Subnet;

fn settings(name: &str, dir: &Path) -> InterfaceSettings {
    InterfaceSettings {
        name: name.into(),
        listen_port: 51820,
        server_address: Ipv4Addr::new(10, 30, 0, 1),
        mask_bits: 24,
        key_dir: dir.join("keys"),
        key_file: "server_private.key".into(),
    }
}

#[test]
fn bring_up_registers_gateway_and_restart_reuses_it() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state").join("peers.toml");

    let registry = FileRegistry::open(state.clone()).unwrap();
    let mut first = InterfaceManager::new(FakeDevice::default(), settings("wg-boot-a", dir.path()));
    let gw = first.bring_up(&registry).unwrap();
    assert!(gw.key_generated);
    assert_eq!(first.state(), LifecycleState::Registered);
    assert_eq!(
        first.device().calls(),
        vec!["create", "configure 51820", "assign 10.30.0.1/24"]
    );

    let record = registry.get_by_id(gw.peer_id).unwrap();
    assert!(record.is_gateway);
    assert_eq!(record.status, PeerStatus::Active);
    assert_eq!(record.assigned_ip, Some(Ipv4Addr::new(10, 30, 0, 1)));
    assert_eq!(record.public_key, gw.public_key);

    let client = wg_gateway::keys::generate_key_pair().unwrap().public_key;
    let allocator = IpAllocator::for_subnet(Subnet::parse("10.30.0.1/24").unwrap(), 100).unwrap();
    let claim = allocator
        .claim(&registry, |ip| NewPeer::pending(client.clone(), ip, None))
        .unwrap();
    first.teardown().unwrap();
    drop(registry);

    let registry = FileRegistry::open(state).unwrap();
    let mut second = InterfaceManager::new(FakeDevice::default(), settings("wg-boot-b", dir.path()));
    let again = second.bring_up(&registry).unwrap();
    assert!(!again.key_generated);
    assert_eq!(again.peer_id, gw.peer_id);
    assert_eq!(registry.list_all().unwrap().iter().filter(|p| p.is_gateway).count(), 1);

    assert_eq!(second.restore_peers(&registry).unwrap(), 1);
    let calls = second.device().calls();
    assert_eq!(calls.last().unwrap(), &format!("peer {client} {}", claim.address));
}

#[test]
fn failed_stage_stops_bring_up() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FileRegistry::open(dir.path().join("peers.toml")).unwrap();
    let mut mgr = InterfaceManager::new(FakeDevice::failing("configure"), settings("wg-boot-fail", dir.path()));
    let err = mgr.bring_up(&registry).unwrap_err();
    assert_eq!(err.stage(), Some(LifecycleState::Configured));
    assert_eq!(mgr.state(), LifecycleState::Absent);
    assert!(registry.list_all().unwrap().is_empty());
    assert_eq!(mgr.device().calls(), vec!["create", "remove"]);
}

#[test]
fn failure_before_create_leaves_nothing_to_remove() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FileRegistry::open(dir.path().join("peers.toml")).unwrap();
    let mut mgr = InterfaceManager::new(FakeDevice::failing("create"), settings("wg-boot-nolink", dir.path()));
    let err = mgr.bring_up(&registry).unwrap_err();
    assert_eq!(err.stage(), Some(LifecycleState::Created));
    assert!(mgr.device().calls().is_empty());
}
