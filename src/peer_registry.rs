use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::{fmt, fs};
use uuid::Uuid;

/// Lifecycle status of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Address reserved, client not yet running
    Pending,
    Active,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// Stored peer record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    /// Base64 WireGuard public key, empty while awaiting key provisioning
    #[serde(default)]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_ip: Option<Ipv4Addr>,
    pub status: PeerStatus,
    #[serde(default)]
    pub is_gateway: bool,
    pub created_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Peer record before the registry assigns its id and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPeer {
    pub public_key: String,
    pub assigned_ip: Option<Ipv4Addr>,
    pub status: PeerStatus,
    pub is_gateway: bool,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl NewPeer {
    /// The server's own record
    pub fn gateway(public_key: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            public_key: public_key.into(),
            assigned_ip: Some(address),
            status: PeerStatus::Active,
            is_gateway: true,
            metadata: None,
        }
    }

    /// A joining peer holding a freshly allocated address
    pub fn pending(
        public_key: impl Into<String>,
        address: Ipv4Addr,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            assigned_ip: Some(address),
            status: PeerStatus::Pending,
            is_gateway: false,
            metadata,
        }
    }

    fn into_peer(self) -> Peer {
        Peer {
            id: Uuid::new_v4(),
            public_key: self.public_key,
            assigned_ip: self.assigned_ip,
            status: self.status,
            is_gateway: self.is_gateway,
            created_on: Utc::now(),
            metadata: self.metadata,
        }
    }
}

/// Durable store of peer records.
///
/// `insert` must reject a record whose address is already held, atomically
/// with respect to other inserts; the allocator relies on that for
/// correctness under concurrent joins.
pub trait PeerRegistry: Send + Sync {
    fn is_address_taken(&self, ip: Ipv4Addr) -> Result<bool, RegistryError>;

    /// Record a peer, returning its new id
    fn insert(&self, peer: NewPeer) -> Result<Uuid, RegistryError>;

    fn get_by_id(&self, id: Uuid) -> Result<Peer, RegistryError>;

    /// All peers in insertion order
    fn list_all(&self) -> Result<Vec<Peer>, RegistryError>;

    /// Snapshot of every assigned address
    fn assigned_addresses(&self) -> Result<HashSet<Ipv4Addr>, RegistryError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter_map(|p| p.assigned_ip)
            .collect())
    }

    fn find_gateway(&self) -> Result<Option<Peer>, RegistryError> {
        Ok(self.list_all()?.into_iter().find(|p| p.is_gateway))
    }
}

fn insert_unique(peers: &mut Vec<Peer>, peer: NewPeer) -> Result<Peer, RegistryError> {
    if let Some(ip) = peer.assigned_ip {
        if peers.iter().any(|p| p.assigned_ip == Some(ip)) {
            return Err(RegistryError::AddressConflict(ip));
        }
    }
    let record = peer.into_peer();
    peers.push(record.clone());
    Ok(record)
}

/// In-process registry, lost on exit
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    peers: Mutex<Vec<Peer>>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerRegistry for MemoryRegistry {
    fn is_address_taken(&self, ip: Ipv4Addr) -> Result<bool, RegistryError> {
        Ok(self.peers.lock().iter().any(|p| p.assigned_ip == Some(ip)))
    }

    fn insert(&self, peer: NewPeer) -> Result<Uuid, RegistryError> {
        let record = insert_unique(&mut self.peers.lock(), peer)?;
        debug!("registry: inserted peer {}", record.id);
        Ok(record.id)
    }

    fn get_by_id(&self, id: Uuid) -> Result<Peer, RegistryError> {
        self.peers
            .lock()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    fn list_all(&self) -> Result<Vec<Peer>, RegistryError> {
        Ok(self.peers.lock().clone())
    }
}

/// Migration recorded in the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    applied_migrations: Vec<AppliedMigration>,
    #[serde(default)]
    peers: Vec<Peer>,
}

type Migration = fn(&mut RegistryState) -> Result<(), String>;

/// Schema steps, applied once each in order and recorded by name
const MIGRATIONS: &[(&str, Migration)] = &[
    ("0001_create_peers", |_| Ok(())),
    ("0002_unique_assigned_ip", |state| {
        let mut seen = HashSet::new();
        for ip in state.peers.iter().filter_map(|p| p.assigned_ip) {
            if !seen.insert(ip) {
                return Err(format!("address {ip} is held by more than one peer"));
            }
        }
        Ok(())
    }),
    ("0003_single_gateway", |state| {
        let gateways = state.peers.iter().filter(|p| p.is_gateway).count();
        if gateways > 1 {
            return Err(format!("{gateways} gateway records present"));
        }
        Ok(())
    }),
];

/// Registry persisted as a TOML state file.
///
/// Every mutation rewrites the file through a temporary sibling and a
/// rename, under the same lock that guards the in-memory copy.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl FileRegistry {
    /// Open (or create) the state file and apply pending migrations
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let mut state = if path.exists() {
            let s = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&s).map_err(|e| RegistryError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            RegistryState::default()
        };

        let applied = apply_migrations(&mut state)?;
        if applied > 0 || !path.exists() {
            persist(&path, &state)?;
        }
        info!(
            "registry opened at {} ({} peers)",
            path.display(),
            state.peers.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the migrations recorded as applied
    #[must_use]
    pub fn applied_migrations(&self) -> Vec<String> {
        self.state
            .lock()
            .applied_migrations
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }
}

fn apply_migrations(state: &mut RegistryState) -> Result<usize, RegistryError> {
    let mut applied = 0;
    for (name, migrate) in MIGRATIONS {
        if state.applied_migrations.iter().any(|m| m.name == *name) {
            debug!("registry: skipping applied migration {name}");
            continue;
        }
        migrate(state).map_err(|reason| RegistryError::Migration {
            name: (*name).to_string(),
            reason,
        })?;
        state.applied_migrations.push(AppliedMigration {
            name: (*name).to_string(),
            applied_at: Utc::now(),
        });
        info!("registry: migration applied: {name}");
        applied += 1;
    }
    Ok(applied)
}

fn persist(path: &Path, state: &RegistryState) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let s = toml::to_string_pretty(state).map_err(|e| RegistryError::Encode(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, s)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })
}

impl PeerRegistry for FileRegistry {
    fn is_address_taken(&self, ip: Ipv4Addr) -> Result<bool, RegistryError> {
        Ok(self
            .state
            .lock()
            .peers
            .iter()
            .any(|p| p.assigned_ip == Some(ip)))
    }

    fn insert(&self, peer: NewPeer) -> Result<Uuid, RegistryError> {
        let mut state = self.state.lock();
        let record = insert_unique(&mut state.peers, peer)?;
        if let Err(e) = persist(&self.path, &state) {
            // keep memory and disk in agreement
            state.peers.retain(|p| p.id != record.id);
            return Err(e);
        }
        debug!("registry: inserted peer {}", record.id);
        Ok(record.id)
    }

    fn get_by_id(&self, id: Uuid) -> Result<Peer, RegistryError> {
        self.state
            .lock()
            .peers
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    fn list_all(&self) -> Result<Vec<Peer>, RegistryError> {
        Ok(self.state.lock().peers.clone())
    }
}
