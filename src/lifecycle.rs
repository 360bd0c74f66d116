//! Gateway interface bring-up
//!
//! Bring-up walks `absent -> created -> configured -> addressed ->
//! registered` exactly once per interface per process. Every step is fatal
//! on failure: the error names the stage that could not be entered and
//! carries the underlying cause.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::{const_mutex, Mutex};
use uuid::Uuid;

use crate::error::{BringupError, DeviceError, RegistryError};
use crate::keys;
use crate::peer_registry::{NewPeer, PeerRegistry};
use crate::wg::TunnelDevice;

/// Interfaces whose bring-up has been attempted in this process
static ATTEMPTED: Mutex<BTreeSet<String>> = const_mutex(BTreeSet::new());

/// Bring-up progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Absent,
    Created,
    Configured,
    Addressed,
    Registered,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Addressed => "addressed",
            Self::Registered => "registered",
        };
        f.write_str(s)
    }
}

/// What bring-up needs to know about the gateway
#[derive(Debug, Clone)]
pub struct InterfaceSettings {
    pub name: String,
    pub listen_port: u16,
    pub server_address: Ipv4Addr,
    pub mask_bits: u8,
    pub key_dir: PathBuf,
    pub key_file: String,
}

/// Result of a successful bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub peer_id: Uuid,
    pub public_key: String,
    pub address: Ipv4Addr,
    /// A new key pair was generated during this bring-up
    pub key_generated: bool,
}

/// Drives one WireGuard interface through bring-up and teardown
pub struct InterfaceManager<D: TunnelDevice> {
    device: Arc<D>,
    settings: InterfaceSettings,
    state: LifecycleState,
}

impl<D: TunnelDevice> InterfaceManager<D> {
    pub fn new(device: D, settings: InterfaceSettings) -> Self {
        Self {
            device: Arc::new(device),
            settings,
            state: LifecycleState::Absent,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Shared handle for adding peers after bring-up
    #[must_use]
    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    /// Run every bring-up stage in order.
    ///
    /// Refused if bring-up of the same interface name was already attempted
    /// in this process, whatever its outcome. A failure after the link was
    /// created removes the link again.
    pub fn bring_up<R>(&mut self, registry: &R) -> Result<Gateway, BringupError>
    where
        R: PeerRegistry + ?Sized,
    {
        let name = self.settings.name.clone();
        if !ATTEMPTED.lock().insert(name.clone()) {
            error!("{name}: bring-up already attempted, refusing to run again");
            return Err(BringupError::AlreadyAttempted(name));
        }

        self.device
            .create()
            .map_err(|e| self.fail(LifecycleState::Created, e))?;
        self.advance(LifecycleState::Created);

        let (pair, key_generated) =
            keys::load_or_generate(&self.settings.key_dir, &self.settings.key_file)
                .map_err(|e| self.fail(LifecycleState::Configured, e))?;
        self.device
            .configure(&pair.private_key, self.settings.listen_port)
            .map_err(|e| self.fail(LifecycleState::Configured, e))?;
        self.advance(LifecycleState::Configured);

        let address = self.settings.server_address;
        self.device
            .assign_address(address, self.settings.mask_bits)
            .map_err(|e| self.fail(LifecycleState::Addressed, e))?;
        self.advance(LifecycleState::Addressed);

        let peer_id = self
            .register(registry, &pair.public_key)
            .map_err(|e| self.fail(LifecycleState::Registered, e))?;
        self.advance(LifecycleState::Registered);

        info!(
            "{name}: gateway live on UDP {} at {}/{}, public key {}",
            self.settings.listen_port, address, self.settings.mask_bits, pair.public_key
        );
        Ok(Gateway {
            peer_id,
            public_key: pair.public_key,
            address,
            key_generated,
        })
    }

    fn register<R>(
        &self,
        registry: &R,
        public_key: &str,
    ) -> Result<Uuid, Box<dyn std::error::Error + Send + Sync>>
    where
        R: PeerRegistry + ?Sized,
    {
        let address = self.settings.server_address;
        if let Some(existing) = registry.find_gateway()? {
            if existing.public_key == public_key && existing.assigned_ip == Some(address) {
                info!("{}: reusing gateway record {}", self.settings.name, existing.id);
                return Ok(existing.id);
            }
            return Err(format!(
                "gateway record {} holds a different key or address ({:?}); \
                 remove it before rotating the server identity",
                existing.id, existing.assigned_ip
            )
            .into());
        }
        Ok(registry.insert(NewPeer::gateway(public_key, address))?)
    }

    /// Re-apply every stored peer that has a key and an address
    pub fn restore_peers<R>(&self, registry: &R) -> Result<usize, RegistryError>
    where
        R: PeerRegistry + ?Sized,
    {
        let mut restored = 0;
        for peer in registry.list_all()? {
            let Some(ip) = peer.assigned_ip else { continue };
            if peer.is_gateway || peer.public_key.is_empty() {
                continue;
            }
            match self.device.add_peer(&peer.public_key, ip) {
                Ok(()) => restored += 1,
                Err(e) => warn!("{}: could not restore peer {}: {e}", self.settings.name, peer.id),
            }
        }
        info!("{}: restored {restored} peers", self.settings.name);
        Ok(restored)
    }

    /// Remove the interface
    pub fn teardown(self) -> Result<(), DeviceError> {
        if self.state == LifecycleState::Absent {
            return Ok(());
        }
        self.device.remove()?;
        info!("{}: interface removed", self.settings.name);
        Ok(())
    }

    fn advance(&mut self, next: LifecycleState) {
        info!("{}: {} -> {}", self.settings.name, self.state, next);
        self.state = next;
    }

    /// Log the failure and remove a partially built link
    fn fail<E>(&mut self, stage: LifecycleState, source: E) -> BringupError
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = source.into();
        error!(
            "{}: bring-up failed entering `{stage}` (reached `{}`): {source}",
            self.settings.name, self.state
        );
        if self.state >= LifecycleState::Created {
            match self.device.remove() {
                Ok(()) => {
                    info!("{}: partial interface removed", self.settings.name);
                    self.state = LifecycleState::Absent;
                }
                Err(e) => warn!("{}: could not remove partial interface: {e}", self.settings.name),
            }
        }
        BringupError::Failed {
            interface: self.settings.name.clone(),
            stage,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_registry::MemoryRegistry;

    #[derive(Default)]
    struct NullDevice {
        fail_assign: bool,
    }

    impl TunnelDevice for NullDevice {
        fn name(&self) -> &str {
            "null"
        }
        fn create(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn configure(&self, _: &str, _: u16) -> Result<(), DeviceError> {
            Ok(())
        }
        fn assign_address(&self, _: Ipv4Addr, _: u8) -> Result<(), DeviceError> {
            if self.fail_assign {
                return Err(DeviceError::Command {
                    command: "ip addr add".into(),
                    reason: "RTNETLINK answers: Operation not permitted".into(),
                });
            }
            Ok(())
        }
        fn add_peer(&self, _: &str, _: Ipv4Addr) -> Result<(), DeviceError> {
            Ok(())
        }
        fn remove(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn settings(name: &str, dir: &std::path::Path) -> InterfaceSettings {
        InterfaceSettings {
            name: name.into(),
            listen_port: 51820,
            server_address: Ipv4Addr::new(10, 0, 0, 1),
            mask_bits: 24,
            key_dir: dir.to_path_buf(),
            key_file: "server_private.key".into(),
        }
    }

    #[test]
    fn failure_names_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let device = NullDevice { fail_assign: true };
        let mut mgr = InterfaceManager::new(device, settings("lc-fail", dir.path()));
        let reg = MemoryRegistry::new();
        let err = mgr.bring_up(&reg).unwrap_err();
        assert_eq!(err.stage(), Some(LifecycleState::Addressed));
        assert_eq!(mgr.state(), LifecycleState::Absent);
        assert!(err.to_string().contains("Operation not permitted"));
        assert!(reg.list_all().unwrap().is_empty());
    }

    #[test]
    fn second_attempt_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let reg = MemoryRegistry::new();
        let mut first = InterfaceManager::new(NullDevice::default(), settings("lc-once", dir.path()));
        first.bring_up(&reg).unwrap();
        let mut second = InterfaceManager::new(NullDevice::default(), settings("lc-once", dir.path()));
        assert!(matches!(
            second.bring_up(&reg),
            Err(BringupError::AlreadyAttempted(_))
        ));
    }

    #[test]
    fn states_are_ordered() {
        assert!(LifecycleState::Absent < LifecycleState::Created);
        assert!(LifecycleState::Addressed < LifecycleState::Registered);
        assert_eq!(LifecycleState::Configured.to_string(), "configured");
    }
}
