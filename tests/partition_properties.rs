use proptest::prelude::*;
use std::net::Ipv4Addr;
use wg_gateway::subnet::{compute_ranges, compute_ranges_str, AddressRange, Subnet};

fn bounded_chunk(subnet: &Subnet, chunk: u32) -> u32 {
    let floor = (subnet.usable_count() / 4096) as u32 + 1;
    chunk.max(floor)
}

proptest! {
    #[test]
    fn ranges_cover_usable_space_exactly(base in any::<u32>(), mask in 0u8..=30, chunk in 1u32..=1024) {
        let subnet = Subnet::new(Ipv4Addr::from(base), mask).unwrap();
        let chunk = bounded_chunk(&subnet, chunk);
        let ranges = compute_ranges(&subnet, chunk).unwrap();
        let network = u32::from(subnet.network());
        let broadcast = u32::from(subnet.broadcast());

        prop_assert!(!ranges.is_empty());
        prop_assert_eq!(u32::from(ranges[0].start), network + 1);
        prop_assert_eq!(u32::from(ranges[ranges.len() - 1].end), broadcast - 1);
        prop_assert_eq!(ranges.iter().map(AddressRange::len).sum::<u64>(), subnet.usable_count());

        for r in &ranges {
            prop_assert!(r.start <= r.end);
            prop_assert!(r.len() <= u64::from(chunk));
        }
        for pair in ranges.windows(2) {
            prop_assert_eq!(u32::from(pair[0].end) + 1, u32::from(pair[1].start));
            let next_offset = u64::from(u32::from(pair[1].start) - network);
            prop_assert_eq!(next_offset % u64::from(chunk), 0);
        }

        prop_assert_eq!(compute_ranges(&subnet, chunk).unwrap(), ranges);
    }

    #[test]
    fn point_to_point_masks_have_no_ranges(base in any::<u32>(), mask in 31u8..=32) {
        let subnet = Subnet::new(Ipv4Addr::from(base), mask).unwrap();
        prop_assert!(compute_ranges(&subnet, 255).unwrap().is_empty());
    }
}

#[test]
fn slash_22_splits_on_chunk_boundaries() {
    let ranges = compute_ranges_str("10.1.0.0/22", 255).unwrap();
    let shown: Vec<String> = ranges.iter().map(ToString::to_string).collect();
    assert_eq!(
        shown,
        vec![
            "10.1.0.1-10.1.0.254",
            "10.1.0.255-10.1.1.253",
            "10.1.1.254-10.1.2.252",
            "10.1.2.253-10.1.3.251",
            "10.1.3.252-10.1.3.254",
        ]
    );
}

#[test]
fn slash_24_is_a_single_range() {
    let ranges = compute_ranges_str("192.168.7.9/24", 255).unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].to_string(), "192.168.7.1-192.168.7.254");
}
