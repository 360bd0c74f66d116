//! Peer address allocator
//!
//! Candidates are the usable host addresses of the subnet minus the server
//! address and every address already recorded in the registry. Selection
//! starts at a random offset and scans forward, wrapping around, so bursts
//! of concurrent joins spread over the whole space instead of piling onto
//! the lowest free address.
//!
//! # Concurrency
//!
//! The allocator holds no mutable state. The registry is the source of
//! truth: each candidate is re-checked with `is_address_taken`, and
//! [`IpAllocator::claim`] relies on the registry rejecting a duplicate
//! address on insert. A candidate lost to a concurrent request counts
//! against the conflict budget and is never retried within the same call.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use log::{debug, warn};
use rand::Rng;
use uuid::Uuid;

use crate::error::{AllocationError, RegistryError, SubnetError};
use crate::peer_registry::{NewPeer, PeerRegistry};
use crate::subnet::Subnet;

/// Default conflict budget per allocation
pub const DEFAULT_MAX_RETRIES: usize = 100;

/// Address recorded by [`IpAllocator::claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub peer_id: Uuid,
    pub address: Ipv4Addr,
}

/// Selects free peer addresses inside one subnet
#[derive(Debug, Clone)]
pub struct IpAllocator {
    subnet: Subnet,
    server_address: Ipv4Addr,
    max_retries: usize,
}

impl IpAllocator {
    /// Allocator for `subnet` reserving `server_address` for the gateway.
    ///
    /// The server address must lie inside the subnet and must not be the
    /// network or broadcast address.
    pub fn new(
        subnet: Subnet,
        server_address: Ipv4Addr,
        max_retries: usize,
    ) -> Result<Self, SubnetError> {
        subnet.validate_server_address(server_address)?;
        Ok(Self {
            subnet,
            server_address,
            max_retries: max_retries.max(1),
        })
    }

    /// Allocator whose server address is the subnet's base address
    pub fn for_subnet(subnet: Subnet, max_retries: usize) -> Result<Self, SubnetError> {
        Self::new(subnet, subnet.base(), max_retries)
    }

    #[must_use]
    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    #[must_use]
    pub fn server_address(&self) -> Ipv4Addr {
        self.server_address
    }

    /// Number of addresses peers can ever hold
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.subnet.usable_count().saturating_sub(1)
    }

    /// Pick one address not in `already_assigned` and not taken in
    /// `registry`. Does not record anything.
    pub fn allocate<R>(
        &self,
        registry: &R,
        already_assigned: &HashSet<Ipv4Addr>,
    ) -> Result<Ipv4Addr, AllocationError>
    where
        R: PeerRegistry + ?Sized,
    {
        let mut attempt = Attempt::default();
        self.select(registry, already_assigned, &mut attempt)
    }

    /// Allocate and record a peer in one optimistic loop.
    ///
    /// `build` turns the chosen address into the record to insert. When the
    /// insert loses a race for the address, that address is excluded and a
    /// new candidate is drawn from a fresh registry snapshot.
    pub fn claim<R, F>(&self, registry: &R, mut build: F) -> Result<Claim, AllocationError>
    where
        R: PeerRegistry + ?Sized,
        F: FnMut(Ipv4Addr) -> NewPeer,
    {
        let mut attempt = Attempt::default();
        loop {
            let assigned = registry.assigned_addresses()?;
            let address = self.select(registry, &assigned, &mut attempt)?;
            match registry.insert(build(address)) {
                Ok(peer_id) => {
                    debug!("allocator: {address} claimed by peer {peer_id}");
                    return Ok(Claim { peer_id, address });
                }
                Err(RegistryError::AddressConflict(lost)) => {
                    debug!("allocator: lost race for {lost}, retrying");
                    attempt.conflict(lost);
                    if attempt.conflicts >= self.max_retries {
                        return Err(self.exhausted(attempt.conflicts));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn select<R>(
        &self,
        registry: &R,
        assigned: &HashSet<Ipv4Addr>,
        attempt: &mut Attempt,
    ) -> Result<Ipv4Addr, AllocationError>
    where
        R: PeerRegistry + ?Sized,
    {
        let (first, last) = self.subnet.usable_bounds().ok_or_else(|| {
            SubnetError::invalid(self.subnet.to_string(), "subnet has no usable host addresses")
        })?;
        let first = u32::from(first);
        let span = u64::from(u32::from(last) - first) + 1;

        let held = assigned
            .iter()
            .filter(|ip| self.is_candidate(**ip))
            .count() as u64;
        if held >= self.capacity() {
            return Err(self.exhausted(attempt.conflicts));
        }

        let offset = rand::thread_rng().gen_range(0..span);
        for step in 0..span {
            let candidate = Ipv4Addr::from(first + ((offset + step) % span) as u32);
            if candidate == self.server_address
                || assigned.contains(&candidate)
                || attempt.tried.contains(&candidate)
            {
                continue;
            }
            if registry.is_address_taken(candidate)? {
                debug!("allocator: {candidate} taken concurrently");
                attempt.conflict(candidate);
                if attempt.conflicts >= self.max_retries {
                    break;
                }
                continue;
            }
            return Ok(candidate);
        }
        Err(self.exhausted(attempt.conflicts))
    }

    fn is_candidate(&self, ip: Ipv4Addr) -> bool {
        ip != self.server_address && self.subnet.contains(ip) && !self.subnet.is_reserved(ip)
    }

    fn exhausted(&self, conflicts: usize) -> AllocationError {
        warn!("allocator: no free address in {}", self.subnet);
        AllocationError::Exhausted {
            subnet: self.subnet.to_string(),
            conflicts,
        }
    }
}

#[derive(Debug, Default)]
struct Attempt {
    tried: HashSet<Ipv4Addr>,
    conflicts: usize,
}

impl Attempt {
    fn conflict(&mut self, ip: Ipv4Addr) {
        self.tried.insert(ip);
        self.conflicts += 1;
    }
}
