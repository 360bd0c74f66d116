use crate::allocator::DEFAULT_MAX_RETRIES;
use crate::artifact::{BuildSettings, DEFAULT_BUILD_TIMEOUT};
use crate::error::{ConfigError, SubnetError};
use crate::lifecycle::InterfaceSettings;
use crate::subnet::{Subnet, DEFAULT_RANGE_CHUNK};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use std::{fs, path::PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "gateway.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API port
    pub http_listen_port: u16,
    pub http_workers: usize,
    pub interface_name: String,
    /// WireGuard UDP port
    pub listen_port: u16,
    pub server_address: Ipv4Addr,
    pub mask_bits: u8,
    /// `host:port` clients dial
    pub public_endpoint: String,
    pub key_dir: PathBuf,
    pub key_file: String,
    pub state_file: PathBuf,
    pub client_dir: PathBuf,
    pub build_program: PathBuf,
    pub binary_name: String,
    pub compile_args: Vec<String>,
    pub output_dir: PathBuf,
    /// Seconds one client build may run before it is killed
    pub build_timeout_secs: u64,
    pub range_chunk: u32,
    pub max_retries: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_port: 8080,
            http_workers: 4,
            interface_name: "wg0".into(),
            listen_port: 51820,
            server_address: Ipv4Addr::new(10, 0, 0, 1),
            mask_bits: 24,
            public_endpoint: "192.168.0.1:51820".into(),
            key_dir: PathBuf::from("config/keys"),
            key_file: "server_private.key".into(),
            state_file: PathBuf::from("state/peers.toml"),
            client_dir: PathBuf::from("./client"),
            build_program: PathBuf::from("cargo"),
            binary_name: "gateway-client".into(),
            compile_args: Vec::new(),
            output_dir: PathBuf::from("./compiled_binaries"),
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT.as_secs(),
            range_chunk: DEFAULT_RANGE_CHUNK,
            max_retries: DEFAULT_MAX_RETRIES,
            log_level: "info".into(),
        }
    }
}

impl ServerConfig {
    /// Subnet descriptor of the tunnel network
    pub fn subnet(&self) -> Result<Subnet, SubnetError> {
        Subnet::new(self.server_address, self.mask_bits)
    }

    /// Server address with prefix, e.g. `10.0.0.1/24`
    #[must_use]
    pub fn server_cidr(&self) -> String {
        format!("{}/{}", self.server_address, self.mask_bits)
    }

    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join(&self.key_file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let subnet = self
            .subnet()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        subnet
            .validate_server_address(self.server_address)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if subnet.usable_count() < 2 {
            return Err(ConfigError::Validation(format!(
                "subnet {subnet} leaves no address for peers"
            )));
        }
        if self.range_chunk == 0 {
            return Err(ConfigError::Validation("range_chunk must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be at least 1".into()));
        }
        if self.build_timeout_secs == 0 {
            return Err(ConfigError::Validation("build_timeout_secs must be at least 1".into()));
        }
        if self.http_workers == 0 {
            return Err(ConfigError::Validation("http_workers must be at least 1".into()));
        }
        if self.interface_name.is_empty() || self.key_file.is_empty() {
            return Err(ConfigError::Validation(
                "interface_name and key_file must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn interface_settings(&self) -> InterfaceSettings {
        InterfaceSettings {
            name: self.interface_name.clone(),
            listen_port: self.listen_port,
            server_address: self.server_address,
            mask_bits: self.mask_bits,
            key_dir: self.key_dir.clone(),
            key_file: self.key_file.clone(),
        }
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            program: self.build_program.clone(),
            client_dir: self.client_dir.clone(),
            binary_name: self.binary_name.clone(),
            extra_args: self.compile_args.clone(),
            output_dir: self.output_dir.clone(),
            mask_bits: self.mask_bits,
            server_endpoint: self.public_endpoint.clone(),
            server_address: self.server_address,
            timeout: Duration::from_secs(self.build_timeout_secs),
        }
    }
}

/**
 * @brief Load the configuration file, writing defaults when it is missing.
 * @param path Config path, `gateway.toml` when `None`.
 * @return Parsed ServerConfig.
 */
pub fn load_server_config(path: Option<PathBuf>) -> Result<ServerConfig, ConfigError> {
    let p = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if !p.exists() {
        let def = ServerConfig::default();
        let s = toml::to_string_pretty(&def).map_err(|e| ConfigError::Encode(e.to_string()))?;
        fs::write(&p, s)?;
        return Ok(def);
    }
    let s = fs::read_to_string(&p)?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse {
        path: p,
        reason: e.to_string(),
    })
}

/**
 * @brief Load the configuration file, apply environment overrides and validate.
 * @param path Config path, `gateway.toml` when `None`.
 * @return Validated ServerConfig.
 */
pub fn load_with_env(path: Option<PathBuf>) -> Result<ServerConfig, ConfigError> {
    let cfg = load_server_config(path)?;
    let cfg = apply_overrides(cfg, |name| std::env::var(name).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Apply environment-style overrides read through `lookup`.
///
/// | variable | field |
/// |---|---|
/// | `PORT` | `http_listen_port` |
/// | `WG_INTERFACE` | `interface_name` |
/// | `WG_PORT` | `listen_port` |
/// | `BACKEND_WG_IP` | `server_address` |
/// | `BACKEND_WG_MASK` | `mask_bits` (`24` or `/24`) |
/// | `SERVER_ENDPOINT` | `public_endpoint` |
/// | `KEY_DIR`, `KEY_FILE` | key location |
/// | `STATE_FILE` | `state_file` |
/// | `CLIENT_DIR`, `BUILD_PROGRAM`, `BINARY_NAME` | toolchain |
/// | `COMPILE_ARGS` | whitespace-separated extra build arguments |
/// | `OUTPUT_DIR` | `output_dir` |
/// | `BUILD_TIMEOUT` | `build_timeout_secs` |
/// | `RANGE_CHUNK`, `ALLOC_RETRIES` | partitioning and allocation |
/// | `WG_GATEWAY_LOG` | `log_level` |
pub fn apply_overrides<F>(mut cfg: ServerConfig, lookup: F) -> Result<ServerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
        value.trim().parse().map_err(|_| ConfigError::Env {
            name: name.into(),
            reason: format!("cannot parse `{value}`"),
        })
    }

    if let Some(v) = lookup("PORT") {
        cfg.http_listen_port = parsed("PORT", &v)?;
    }
    if let Some(v) = lookup("WG_INTERFACE") {
        cfg.interface_name = v;
    }
    if let Some(v) = lookup("WG_PORT") {
        cfg.listen_port = parsed("WG_PORT", &v)?;
    }
    if let Some(v) = lookup("BACKEND_WG_IP") {
        cfg.server_address = parsed("BACKEND_WG_IP", &v)?;
    }
    if let Some(v) = lookup("BACKEND_WG_MASK") {
        cfg.mask_bits = parsed("BACKEND_WG_MASK", v.trim().trim_start_matches('/'))?;
    }
    if let Some(v) = lookup("SERVER_ENDPOINT") {
        cfg.public_endpoint = v;
    }
    if let Some(v) = lookup("KEY_DIR") {
        cfg.key_dir = v.into();
    }
    if let Some(v) = lookup("KEY_FILE") {
        cfg.key_file = v;
    }
    if let Some(v) = lookup("STATE_FILE") {
        cfg.state_file = v.into();
    }
    if let Some(v) = lookup("CLIENT_DIR") {
        cfg.client_dir = v.into();
    }
    if let Some(v) = lookup("BUILD_PROGRAM") {
        cfg.build_program = v.into();
    }
    if let Some(v) = lookup("BINARY_NAME") {
        cfg.binary_name = v;
    }
    if let Some(v) = lookup("COMPILE_ARGS") {
        cfg.compile_args = v.split_whitespace().map(str::to_string).collect();
    }
    if let Some(v) = lookup("OUTPUT_DIR") {
        cfg.output_dir = v.into();
    }
    if let Some(v) = lookup("BUILD_TIMEOUT") {
        cfg.build_timeout_secs = parsed("BUILD_TIMEOUT", &v)?;
    }
    if let Some(v) = lookup("RANGE_CHUNK") {
        cfg.range_chunk = parsed("RANGE_CHUNK", &v)?;
    }
    if let Some(v) = lookup("ALLOC_RETRIES") {
        cfg.max_retries = parsed("ALLOC_RETRIES", &v)?;
    }
    if let Some(v) = lookup("WG_GATEWAY_LOG") {
        cfg.log_level = v;
    }
    Ok(cfg)
}
