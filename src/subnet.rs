//! Subnet descriptor and address-space partitioning
//!
//! A [`Subnet`] is the configured gateway address plus its prefix length,
//! e.g. `10.0.0.1/24`. Its usable host space is every address strictly
//! between the network and broadcast addresses. [`compute_ranges`] splits
//! that space into contiguous [`AddressRange`] chunks of bounded size for
//! display and iteration.
//!
//! Chunk boundaries sit on multiples of the chunk size counted from the
//! network address, so the first chunk is one short (it never contains the
//! network address) and the last chunk takes whatever remains before the
//! broadcast address.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::SubnetError;

/// Default maximum number of addresses in one range
pub const DEFAULT_RANGE_CHUNK: u32 = 255;

/// Inclusive span of IPv4 addresses, `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

#[derive(Deserialize)]
struct RawRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl TryFrom<RawRange> for AddressRange {
    type Error = SubnetError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl AddressRange {
    /// Range from `start` to `end` inclusive, rejecting reversed bounds
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, SubnetError> {
        if start > end {
            return Err(SubnetError::invalid(
                format!("{start}-{end}"),
                "range start is after its end",
            ));
        }
        Ok(Self { start, end })
    }

    /// Number of addresses in the range
    #[must_use]
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    /// Ranges always hold at least one address
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.start)..=u32::from(self.end)).contains(&u32::from(ip))
    }

    /// Addresses of the range in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// IPv4 subnet descriptor: base address and prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    net: Ipv4Net,
}

impl Subnet {
    /// Build a subnet from a base address and mask bits (0..=32)
    pub fn new(base: Ipv4Addr, mask_bits: u8) -> Result<Self, SubnetError> {
        let net = Ipv4Net::new(base, mask_bits).map_err(|_| {
            SubnetError::invalid(
                format!("{base}/{mask_bits}"),
                "prefix length must be between 0 and 32",
            )
        })?;
        Ok(Self { net })
    }

    /// Parse CIDR text such as `10.0.0.1/24`
    pub fn parse(cidr: &str) -> Result<Self, SubnetError> {
        let trimmed = cidr.trim();
        match Ipv4Net::from_str(trimmed) {
            Ok(net) => Ok(Self { net }),
            Err(_) if Ipv6Net::from_str(trimmed).is_ok() => Err(SubnetError::invalid(
                cidr,
                "only IPv4 subnets are supported",
            )),
            Err(e) => Err(SubnetError::invalid(cidr, e.to_string())),
        }
    }

    /// Configured address (host bits preserved)
    #[must_use]
    pub fn base(&self) -> Ipv4Addr {
        self.net.addr()
    }

    #[must_use]
    pub fn mask_bits(&self) -> u8 {
        self.net.prefix_len()
    }

    /// All host bits zero
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    /// All host bits one
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(&ip)
    }

    /// Network or broadcast address
    #[must_use]
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.network() || ip == self.broadcast()
    }

    /// First and last usable host address, `None` for /31 and /32
    #[must_use]
    pub fn usable_bounds(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        if self.mask_bits() > 30 {
            return None;
        }
        let first = u32::from(self.network()) + 1;
        let last = u32::from(self.broadcast()) - 1;
        Some((Ipv4Addr::from(first), Ipv4Addr::from(last)))
    }

    /// Number of usable host addresses
    #[must_use]
    pub fn usable_count(&self) -> u64 {
        self.usable_bounds()
            .map_or(0, |(first, last)| AddressRange { start: first, end: last }.len())
    }

    /// Lazily partition the usable space into chunks of at most `max_chunk`
    pub fn ranges(&self, max_chunk: u32) -> Result<RangeIter, SubnetError> {
        if max_chunk == 0 {
            return Err(SubnetError::invalid(
                self.to_string(),
                "range chunk size must be at least 1",
            ));
        }
        let origin = u64::from(u32::from(self.network()));
        let chunk = u64::from(max_chunk);
        Ok(match self.usable_bounds() {
            Some((first, last)) => RangeIter {
                next: u64::from(u32::from(first)),
                last: u64::from(u32::from(last)),
                origin,
                chunk,
            },
            None => RangeIter {
                next: 1,
                last: 0,
                origin,
                chunk,
            },
        })
    }

    /// Check that `server` may act as the gateway address of this subnet
    pub fn validate_server_address(&self, server: Ipv4Addr) -> Result<(), SubnetError> {
        if !self.contains(server) {
            return Err(SubnetError::invalid(
                self.to_string(),
                format!("server address {server} is outside the subnet"),
            ));
        }
        if self.is_reserved(server) {
            return Err(SubnetError::invalid(
                self.to_string(),
                format!("server address {server} is the network or broadcast address"),
            ));
        }
        Ok(())
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base(), self.mask_bits())
    }
}

/// Iterator over the chunked usable space of a subnet
#[derive(Debug, Clone)]
pub struct RangeIter {
    next: u64,
    last: u64,
    origin: u64,
    chunk: u64,
}

impl Iterator for RangeIter {
    type Item = AddressRange;

    fn next(&mut self) -> Option<AddressRange> {
        if self.next > self.last {
            return None;
        }
        let start = self.next;
        let block = (start - self.origin) / self.chunk;
        let block_end = self.origin + (block + 1) * self.chunk - 1;
        let end = block_end.min(self.last);
        self.next = end + 1;
        // Both bounds lie inside one IPv4 subnet, so they fit in u32.
        Some(AddressRange {
            start: Ipv4Addr::from(start as u32),
            end: Ipv4Addr::from(end as u32),
        })
    }
}

/// Partition the usable host space of `subnet` into ascending chunks
pub fn compute_ranges(subnet: &Subnet, max_chunk: u32) -> Result<Vec<AddressRange>, SubnetError> {
    Ok(subnet.ranges(max_chunk)?.collect())
}

/// Parse `cidr` and partition it
pub fn compute_ranges_str(cidr: &str, max_chunk: u32) -> Result<Vec<AddressRange>, SubnetError> {
    compute_ranges(&Subnet::parse(cidr)?, max_chunk)
}
