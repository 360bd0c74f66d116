#![allow(dead_code)]

use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wg_gateway::allocator::IpAllocator;
use wg_gateway::artifact::{create_build_dir, ArtifactBuilder, Target};
use wg_gateway::enroll_http::{spawn_api_server, ApiServer};
use wg_gateway::error::{ArtifactError, DeviceError};
use wg_gateway::peer_registry::{MemoryRegistry, PeerRegistry};
use wg_gateway::service::PeerService;
use wg_gateway::subnet::Subnet;
use wg_gateway::wg::TunnelDevice;

/// Tunnel device that records every call
#[derive(Default)]
pub struct FakeDevice {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Option<&'static str>,
}

impl FakeDevice {
    pub fn failing(op: &'static str) -> Self {
        Self { fail_on: Some(op), ..Self::default() }
    }

    fn record(&self, op: &'static str, detail: String) -> Result<(), DeviceError> {
        if self.fail_on == Some(op) {
            return Err(DeviceError::Command { command: op.into(), reason: "injected failure".into() });
        }
        self.calls.lock().push(format!("{op} {detail}").trim_end().to_string());
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl TunnelDevice for FakeDevice {
    fn name(&self) -> &str {
        "fake"
    }
    fn create(&self) -> Result<(), DeviceError> {
        self.record("create", String::new())
    }
    fn configure(&self, _private_key_b64: &str, listen_port: u16) -> Result<(), DeviceError> {
        self.record("configure", listen_port.to_string())
    }
    fn assign_address(&self, address: Ipv4Addr, mask_bits: u8) -> Result<(), DeviceError> {
        self.record("assign", format!("{address}/{mask_bits}"))
    }
    fn add_peer(&self, public_key_b64: &str, allowed_ip: Ipv4Addr) -> Result<(), DeviceError> {
        self.record("peer", format!("{public_key_b64} {allowed_ip}"))
    }
    fn remove(&self) -> Result<(), DeviceError> {
        self.record("remove", String::new())
    }
}

/// Builder that writes a small file instead of compiling
pub struct FakeBuilder {
    pub output_dir: PathBuf,
    pub fail: bool,
}

impl ArtifactBuilder for FakeBuilder {
    fn build(&self, target: Target, server_public_key: &str, assigned_ip: Ipv4Addr) -> Result<PathBuf, ArtifactError> {
        if self.fail {
            return Err(ArtifactError::CompilationFailed("toolchain missing".into()));
        }
        let dir = create_build_dir(&self.output_dir)?;
        let file = dir.join(target.binary_name("gateway-client"));
        std::fs::write(&file, format!("{assigned_ip} {server_public_key}"))
            .map_err(|source| ArtifactError::Io { path: file.clone(), source })?;
        Ok(file.strip_prefix(&self.output_dir).unwrap().to_path_buf())
    }
}

pub fn public_key() -> String {
    wg_gateway::keys::generate_key_pair().unwrap().public_key
}

pub fn service(cidr: &str, output_dir: &Path, fail_build: bool) -> (Arc<PeerService>, Arc<MemoryRegistry>) {
    let registry = Arc::new(MemoryRegistry::new());
    let allocator = IpAllocator::for_subnet(Subnet::parse(cidr).unwrap(), 100).unwrap();
    let builder = FakeBuilder { output_dir: output_dir.to_path_buf(), fail: fail_build };
    let registry_dyn: Arc<dyn PeerRegistry> = registry.clone();
    let svc = PeerService::new(registry_dyn, allocator, Arc::new(builder), public_key(), 255);
    (Arc::new(svc), registry)
}

pub fn spawn(service: Arc<PeerService>, output_dir: &Path) -> ApiServer {
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    spawn_api_server(bind, service, output_dir.to_path_buf(), 2).unwrap()
}

/// Send one raw HTTP/1.1 request and return the full response text
pub fn http(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).unwrap();
    let mut resp = String::new();
    stream.read_to_string(&mut resp).unwrap();
    resp
}

pub fn status(resp: &str) -> u16 {
    resp.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0)
}

pub fn body(resp: &str) -> &str {
    resp.split("\r\n\r\n").nth(1).unwrap_or("")
}

pub fn json(resp: &str) -> serde_json::Value {
    serde_json::from_str(body(resp)).unwrap()
}
