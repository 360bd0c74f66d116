use proptest::prelude::*;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use wg_gateway::allocator::IpAllocator;
use wg_gateway::error::AllocationError;
use wg_gateway::peer_registry::{FileRegistry, MemoryRegistry, NewPeer, PeerRegistry};
use wg_gateway::subnet::Subnet;

fn claim_one<R: PeerRegistry + ?Sized>(alloc: &IpAllocator, registry: &R) -> Result<Ipv4Addr, AllocationError> {
    alloc
        .claim(registry, |ip| NewPeer::pending("", ip, None))
        .map(|c| c.address)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sequential_claims_are_distinct_and_usable(mask in 24u8..=29, n in 1usize..40) {
        let subnet = Subnet::new(Ipv4Addr::new(172, 16, 5, 1), mask).unwrap();
        let alloc = IpAllocator::for_subnet(subnet, 100).unwrap();
        let n = n.min(alloc.capacity() as usize);
        let registry = MemoryRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..n {
            let ip = claim_one(&alloc, &registry).unwrap();
            prop_assert!(subnet.contains(ip));
            prop_assert!(!subnet.is_reserved(ip));
            prop_assert_ne!(ip, alloc.server_address());
            prop_assert!(seen.insert(ip));
        }
    }
}

#[test]
fn slash_29_yields_five_then_exhausts() {
    let subnet = Subnet::parse("10.0.0.1/29").unwrap();
    let alloc = IpAllocator::for_subnet(subnet, 100).unwrap();
    let registry = MemoryRegistry::new();
    registry.insert(NewPeer::gateway("srv", Ipv4Addr::new(10, 0, 0, 1))).unwrap();

    let ips: HashSet<_> = (0..5).map(|_| claim_one(&alloc, &registry).unwrap()).collect();
    let expected: HashSet<_> = (2..=6).map(|h| Ipv4Addr::new(10, 0, 0, h)).collect();
    assert_eq!(ips, expected);
    assert!(matches!(
        claim_one(&alloc, &registry),
        Err(AllocationError::Exhausted { .. })
    ));
}

#[test]
fn allocate_skips_caller_snapshot() {
    let subnet = Subnet::parse("10.0.0.1/30").unwrap();
    let alloc = IpAllocator::for_subnet(subnet, 100).unwrap();
    let registry = MemoryRegistry::new();
    let ip = alloc.allocate(&registry, &HashSet::new()).unwrap();
    assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
    let full: HashSet<_> = [ip].into_iter().collect();
    assert!(alloc.allocate(&registry, &full).is_err());
}

fn concurrent_claims<R: PeerRegistry + 'static>(registry: Arc<R>, threads: usize, per_thread: usize) -> Vec<Ipv4Addr> {
    let alloc = IpAllocator::for_subnet(Subnet::parse("10.50.0.1/23").unwrap(), 100).unwrap();
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let alloc = alloc.clone();
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| claim_one(&alloc, &*registry).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
}

#[test]
fn concurrent_claims_never_collide_in_memory() {
    let registry = Arc::new(MemoryRegistry::new());
    let ips = concurrent_claims(Arc::clone(&registry), 16, 20);
    assert_eq!(ips.iter().collect::<HashSet<_>>().len(), 320);
    assert_eq!(registry.assigned_addresses().unwrap().len(), 320);
}

#[test]
fn concurrent_claims_never_collide_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.toml");
    let registry = Arc::new(FileRegistry::open(path.clone()).unwrap());
    let ips = concurrent_claims(Arc::clone(&registry), 8, 10);
    assert_eq!(ips.iter().collect::<HashSet<_>>().len(), 80);

    let reopened = FileRegistry::open(path).unwrap();
    let stored: HashSet<_> = reopened.assigned_addresses().unwrap();
    assert_eq!(stored, ips.into_iter().collect());
}
