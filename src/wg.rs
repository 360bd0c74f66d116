use crate::error::DeviceError;
use crate::keys;
use defguard_wireguard_rs::{
    host::Peer, key::Key, net::IpAddrMask, InterfaceConfiguration, Kernel, WGApi,
    WireguardInterfaceApi,
};
use log::debug;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;

/// Operations the interface lifecycle needs from the platform.
///
/// [`KernelDevice`] drives a kernel WireGuard link; tests substitute a
/// recording fake.
pub trait TunnelDevice: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Create the WireGuard link and bring it up
    fn create(&self) -> Result<(), DeviceError>;

    /// Set the private key and UDP listen port
    fn configure(&self, private_key_b64: &str, listen_port: u16) -> Result<(), DeviceError>;

    /// Assign `address/mask_bits` to the link
    fn assign_address(&self, address: Ipv4Addr, mask_bits: u8) -> Result<(), DeviceError>;

    /// Allow a peer to reach the tunnel from `allowed_ip/32`
    fn add_peer(&self, public_key_b64: &str, allowed_ip: Ipv4Addr) -> Result<(), DeviceError>;

    /// Delete the link
    fn remove(&self) -> Result<(), DeviceError>;
}

/// Kernel WireGuard interface controlled over netlink
pub struct KernelDevice {
    name: String,
    api: WGApi<Kernel>,
}

impl KernelDevice {
    pub fn new(name: impl Into<String>) -> Result<Self, DeviceError> {
        let name = name.into();
        let api = WGApi::<Kernel>::new(name.clone()).map_err(|e| DeviceError::Wireguard {
            op: "open control channel",
            reason: e.to_string(),
        })?;
        Ok(Self { name, api })
    }
}

/**
 * @brief Build a WireGuard peer whose only allowed IP is the assigned address.
 * @param public_key_b64 Peer public key (Base64-encoded, 32 bytes).
 * @param allowed_ip Address assigned to the peer.
 * @return Peer ready to apply to the interface.
 */
pub fn wireguard_peer(public_key_b64: &str, allowed_ip: Ipv4Addr) -> Result<Peer, DeviceError> {
    let raw = keys::decode_key(public_key_b64).map_err(|e| DeviceError::InvalidKey(e.to_string()))?;
    let mut peer = Peer::new(Key::new(raw));
    peer.allowed_ips.push(IpAddrMask::new(IpAddr::V4(allowed_ip), 32));
    Ok(peer)
}

/**
 * @brief Build the interface configuration carrying key and port only.
 * @param ifname Interface name.
 * @param private_key_b64 Base64-encoded server private key.
 * @param listen_port UDP listen port.
 * @return InterfaceConfiguration ready to apply.
 */
pub fn interface_config(ifname: &str, private_key_b64: &str, listen_port: u16) -> InterfaceConfiguration {
    InterfaceConfiguration {
        name: ifname.to_string(),
        prvkey: private_key_b64.to_string(),
        addresses: Vec::new(),
        port: u32::from(listen_port),
        peers: Vec::new(),
        mtu: None,
    }
}

impl TunnelDevice for KernelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Result<(), DeviceError> {
        self.api.create_interface().map_err(|e| DeviceError::Wireguard {
            op: "create interface",
            reason: e.to_string(),
        })?;
        run_ip(&["link", "set", &self.name, "up"])
    }

    fn configure(&self, private_key_b64: &str, listen_port: u16) -> Result<(), DeviceError> {
        let config = interface_config(&self.name, private_key_b64, listen_port);
        #[cfg(target_os = "windows")]
        let result = self.api.configure_interface(&config, &[], &[]);
        #[cfg(not(target_os = "windows"))]
        let result = self.api.configure_interface(&config);
        result.map_err(|e| DeviceError::Wireguard {
            op: "configure interface",
            reason: e.to_string(),
        })
    }

    fn assign_address(&self, address: Ipv4Addr, mask_bits: u8) -> Result<(), DeviceError> {
        let mask = IpAddrMask::new(IpAddr::V4(address), mask_bits);
        self.api.assign_address(&mask).map_err(|e| DeviceError::Wireguard {
            op: "assign address",
            reason: e.to_string(),
        })
    }

    fn add_peer(&self, public_key_b64: &str, allowed_ip: Ipv4Addr) -> Result<(), DeviceError> {
        let peer = wireguard_peer(public_key_b64, allowed_ip)?;
        self.api.configure_peer(&peer).map_err(|e| DeviceError::Wireguard {
            op: "configure peer",
            reason: e.to_string(),
        })?;
        debug!("{}: peer {} allowed from {}/32", self.name, public_key_b64, allowed_ip);
        Ok(())
    }

    fn remove(&self) -> Result<(), DeviceError> {
        let _ = run_ip(&["link", "set", &self.name, "down"]);
        self.api.remove_interface().map_err(|e| DeviceError::Wireguard {
            op: "remove interface",
            reason: e.to_string(),
        })
    }
}

fn run_ip(args: &[&str]) -> Result<(), DeviceError> {
    let command = format!("ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| DeviceError::Command {
            command: command.clone(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(DeviceError::Command {
            command,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_allows_only_its_address() {
        let pair = keys::generate_key_pair().unwrap();
        let peer = wireguard_peer(&pair.public_key, Ipv4Addr::new(10, 0, 0, 9)).unwrap();
        assert_eq!(peer.allowed_ips.len(), 1);
        assert_eq!(peer.allowed_ips[0].to_string(), "10.0.0.9/32");
    }

    #[test]
    fn peer_with_bad_key_is_rejected() {
        assert!(matches!(
            wireguard_peer("AAAA", Ipv4Addr::new(10, 0, 0, 9)),
            Err(DeviceError::InvalidKey(_))
        ));
    }

    #[test]
    fn interface_config_carries_key_and_port() {
        let pair = keys::generate_key_pair().unwrap();
        let cfg = interface_config("wg-test", &pair.private_key, 51820);
        assert_eq!(cfg.name, "wg-test");
        assert_eq!(cfg.port, 51820);
        assert!(cfg.addresses.is_empty());
        assert!(cfg.peers.is_empty());
    }
}
