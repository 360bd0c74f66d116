//! Peer registration flow
//!
//! A join request is served in a fixed order: validate the request, claim
//! an address by recording the peer, allow the peer on the tunnel, then
//! build its client. The build runs only after the record exists; when the
//! build fails the peer keeps its address and stays `pending`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocator::IpAllocator;
use crate::artifact::{ArtifactBuilder, Target};
use crate::error::{GatewayError, RegistryError};
use crate::keys;
use crate::peer_registry::{NewPeer, Peer, PeerRegistry};
use crate::subnet::AddressRange;
use crate::wg::TunnelDevice;

/// Ranges listed in a subnet summary before truncation
pub const SUMMARY_RANGE_LIMIT: usize = 256;

/// Body of `POST /peer`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub public_key: Option<String>,
    pub os_arch: String,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Successful join
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    pub id: Uuid,
    pub assigned_ip: Ipv4Addr,
    pub download_link: String,
}

/// Body of `GET /subnet`
#[derive(Debug, Clone, Serialize)]
pub struct SubnetSummary {
    pub subnet: String,
    pub server_address: Ipv4Addr,
    pub network: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub capacity: u64,
    pub assigned: usize,
    pub total_ranges: usize,
    pub ranges: Vec<AddressRange>,
}

/// Orchestrates registry, allocator, tunnel device and client builds
pub struct PeerService {
    registry: Arc<dyn PeerRegistry>,
    allocator: IpAllocator,
    builder: Arc<dyn ArtifactBuilder>,
    device: Option<Arc<dyn TunnelDevice>>,
    server_public_key: String,
    range_chunk: u32,
}

impl PeerService {
    pub fn new(
        registry: Arc<dyn PeerRegistry>,
        allocator: IpAllocator,
        builder: Arc<dyn ArtifactBuilder>,
        server_public_key: impl Into<String>,
        range_chunk: u32,
    ) -> Self {
        Self {
            registry,
            allocator,
            builder,
            device: None,
            server_public_key: server_public_key.into(),
            range_chunk,
        }
    }

    /// Apply newly registered peers to this device
    #[must_use]
    pub fn with_device(mut self, device: Arc<dyn TunnelDevice>) -> Self {
        self.device = Some(device);
        self
    }

    #[must_use]
    pub fn allocator(&self) -> &IpAllocator {
        &self.allocator
    }

    /// Register a joining peer and build its client
    pub fn register(&self, request: JoinRequest) -> Result<JoinOutcome, GatewayError> {
        let target: Target = request.os_arch.parse()?;
        let public_key = request
            .public_key
            .map(|k| k.trim().to_string())
            .unwrap_or_default();
        if !public_key.is_empty() {
            keys::validate_public_key_b64(&public_key)?;
        }

        let metadata = request.metadata;
        let claim = self.allocator.claim(&*self.registry, |ip| {
            NewPeer::pending(public_key.clone(), ip, metadata.clone())
        })?;
        info!(
            "peer {} registered at {} ({})",
            claim.peer_id,
            claim.address,
            if public_key.is_empty() { "awaiting key" } else { "key provided" }
        );

        if let Some(device) = self.device.as_ref().filter(|_| !public_key.is_empty()) {
            if let Err(e) = device.add_peer(&public_key, claim.address) {
                // re-applied from the registry on next start
                warn!("peer {}: tunnel update failed: {e}", claim.peer_id);
            }
        }

        let artifact = self
            .builder
            .build(target, &self.server_public_key, claim.address)
            .map_err(|source| {
                warn!("peer {}: client build failed, record kept as pending", claim.peer_id);
                GatewayError::BuildFailed {
                    peer_id: claim.peer_id,
                    assigned_ip: claim.address,
                    source,
                }
            })?;

        let link = artifact
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(JoinOutcome {
            id: claim.peer_id,
            assigned_ip: claim.address,
            download_link: format!("/downloads/{link}"),
        })
    }

    pub fn get_peer(&self, id: Uuid) -> Result<Peer, RegistryError> {
        self.registry.get_by_id(id)
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>, RegistryError> {
        self.registry.list_all()
    }

    pub fn subnet_summary(&self) -> Result<SubnetSummary, GatewayError> {
        let subnet = *self.allocator.subnet();
        let ranges = subnet.ranges(self.range_chunk)?;
        let total_ranges = ranges.clone().count();
        let assigned = self
            .registry
            .assigned_addresses()?
            .into_iter()
            .filter(|ip| *ip != self.allocator.server_address())
            .count();
        Ok(SubnetSummary {
            subnet: subnet.to_string(),
            server_address: self.allocator.server_address(),
            network: subnet.network(),
            broadcast: subnet.broadcast(),
            capacity: self.allocator.capacity(),
            assigned,
            total_ranges,
            ranges: ranges.take(SUMMARY_RANGE_LIMIT).collect(),
        })
    }
}
