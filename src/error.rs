//! Error types for the gateway control plane.
//!
//! Each subsystem owns a closed error enum; [`GatewayError`] folds them
//! together for the HTTP layer and the binary.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::LifecycleState;

/// Top-level error type
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Subnet(#[from] SubnetError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Bringup(#[from] BringupError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Client build failed after the peer was recorded. The peer keeps its
    /// address and stays `pending`.
    #[error("client build for peer {peer_id} ({assigned_ip}) failed: {source}")]
    BuildFailed {
        peer_id: Uuid,
        assigned_ip: Ipv4Addr,
        #[source]
        source: ArtifactError,
    },

    /// Malformed request payload
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// HTTP status code used when this error reaches an API caller
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Subnet(_) | Self::BadRequest(_) => 400,
            Self::Key(KeyError::InvalidKey(_)) => 400,
            Self::Artifact(ArtifactError::InvalidTarget(_)) => 400,
            Self::Allocation(AllocationError::Exhausted { .. }) => 503,
            Self::Allocation(AllocationError::InvalidSubnet(_)) => 400,
            Self::Registry(RegistryError::NotFound(_)) => 404,
            _ => 500,
        }
    }

    /// Errors that must abort process start
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bringup(_) | Self::Config(_) | Self::Device(_) => true,
            Self::Key(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Subnet descriptor errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubnetError {
    /// Malformed CIDR, non-IPv4 family, degenerate mask or bad server address
    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },
}

impl SubnetError {
    pub fn invalid(subnet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSubnet {
            subnet: subnet.into(),
            reason: reason.into(),
        }
    }
}

/// Address allocation errors
#[derive(Debug, Error)]
pub enum AllocationError {
    /// No candidate left, or the conflict budget ran out
    #[error("no capacity left in {subnet} after {conflicts} conflicting candidates")]
    Exhausted { subnet: String, conflicts: usize },

    /// Subnet cannot host any peer
    #[error(transparent)]
    InvalidSubnet(#[from] SubnetError),

    /// Registry failure while checking or recording an address
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Peer registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The address is already held by another peer record
    #[error("address {0} is already assigned")]
    AddressConflict(Ipv4Addr),

    #[error("peer {0} not found")]
    NotFound(Uuid),

    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry state {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to encode registry state: {0}")]
    Encode(String),

    #[error("migration {name} failed: {reason}")]
    Migration { name: String, reason: String },
}

/// Key management errors
#[derive(Debug, Error)]
pub enum KeyError {
    /// The OS entropy source failed
    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Refusing to overwrite an existing private key file
    #[error("key file {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("key file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl KeyError {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::GenerationFailed(_))
    }
}

/// Errors raised by a tunnel device implementation
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("wireguard control error during {op}: {reason}")]
    Wireguard { op: &'static str, reason: String },

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Interface bring-up errors. Always fatal.
#[derive(Debug, Error)]
pub enum BringupError {
    #[error("interface {interface} bring-up failed while entering `{stage}`: {source}")]
    Failed {
        interface: String,
        stage: LifecycleState,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("bring-up of interface {0} was already attempted in this process")]
    AlreadyAttempted(String),
}

impl BringupError {
    /// Stage that failed, if any
    #[must_use]
    pub fn stage(&self) -> Option<LifecycleState> {
        match self {
            Self::Failed { stage, .. } => Some(*stage),
            Self::AlreadyAttempted(_) => None,
        }
    }
}

/// Client artifact build errors
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unsupported target platform `{0}`")]
    InvalidTarget(String),

    #[error("compilation failed: {0}")]
    CompilationFailed(String),

    #[error("artifact I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("failed to encode configuration: {0}")]
    Encode(String),

    #[error("environment variable {name}: {reason}")]
    Env { name: String, reason: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] io::Error),
}
