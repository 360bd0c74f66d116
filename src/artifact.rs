//! Client artifact builds
//!
//! A client binary is compiled by an external toolchain (`cargo` by
//! default) with the peer's identity passed through the environment:
//!
//! | variable | value |
//! |---|---|
//! | `ADDR` | assigned peer address |
//! | `CIDR` | subnet prefix length |
//! | `SERVERPUB` | gateway public key |
//! | `SERVERENDPOINT` | public `host:port` of the gateway |
//! | `SERVERIP` | gateway tunnel address |
//!
//! Each finished binary is moved into its own directory under the output
//! root, named after a nanosecond timestamp. A build that outlives its
//! deadline is killed and reported as a compilation failure.

use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

/// Default limit on one client build
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Supported client platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "x86_64-linux")]
    X86_64Linux,
    #[serde(rename = "aarch64-linux")]
    Aarch64Linux,
    #[serde(rename = "x86_64-windows")]
    X86_64Windows,
}

impl Target {
    pub const ALL: [Target; 3] = [Self::X86_64Linux, Self::Aarch64Linux, Self::X86_64Windows];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X86_64Linux => "x86_64-linux",
            Self::Aarch64Linux => "aarch64-linux",
            Self::X86_64Windows => "x86_64-windows",
        }
    }

    /// Rust target triple handed to the toolchain
    #[must_use]
    pub const fn triple(self) -> &'static str {
        match self {
            Self::X86_64Linux => "x86_64-unknown-linux-gnu",
            Self::Aarch64Linux => "aarch64-unknown-linux-gnu",
            Self::X86_64Windows => "x86_64-pc-windows-gnu",
        }
    }

    /// File name of the produced binary
    #[must_use]
    pub fn binary_name(self, base: &str) -> String {
        match self {
            Self::X86_64Windows => format!("{base}.exe"),
            _ => base.to_string(),
        }
    }

    /// Linker override needed when cross-compiling
    #[must_use]
    pub const fn rustflags(self) -> Option<&'static str> {
        match self {
            Self::X86_64Linux => Some("-C linker=x86_64-linux-gnu-gcc"),
            Self::Aarch64Linux => Some("-C linker=aarch64-linux-gnu-gcc"),
            Self::X86_64Windows => None,
        }
    }
}

impl FromStr for Target {
    type Err = ArtifactError;

    /// Accepts the short platform name or the matching target triple
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.triple() == s)
            .ok_or_else(|| ArtifactError::InvalidTarget(s.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a client binary for one peer
pub trait ArtifactBuilder: Send + Sync {
    /// Returns the artifact path relative to the output root
    fn build(
        &self,
        target: Target,
        server_public_key: &str,
        assigned_ip: Ipv4Addr,
    ) -> Result<PathBuf, ArtifactError>;
}

/// Toolchain settings
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Program to run, `cargo` unless overridden
    pub program: PathBuf,
    pub client_dir: PathBuf,
    pub binary_name: String,
    pub extra_args: Vec<String>,
    pub output_dir: PathBuf,
    pub mask_bits: u8,
    pub server_endpoint: String,
    pub server_address: Ipv4Addr,
    /// Wall-clock limit for one build
    pub timeout: Duration,
}

/// Runs `<program> build --release --target <triple>` in the client crate
#[derive(Debug, Clone)]
pub struct CargoBuilder {
    settings: BuildSettings,
}

impl CargoBuilder {
    #[must_use]
    pub fn new(settings: BuildSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    fn command(&self, target: Target, server_public_key: &str, assigned_ip: Ipv4Addr) -> Command {
        let s = &self.settings;
        let mut cmd = Command::new(&s.program);
        cmd.args(["build", "--release", "--target", target.triple()])
            .args(&s.extra_args)
            .current_dir(&s.client_dir)
            .env("ADDR", assigned_ip.to_string())
            .env("CIDR", s.mask_bits.to_string())
            .env("SERVERPUB", server_public_key)
            .env("SERVERENDPOINT", &s.server_endpoint)
            .env("SERVERIP", s.server_address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(flags) = target.rustflags() {
            cmd.env("RUSTFLAGS", flags);
        }
        cmd
    }
}

impl ArtifactBuilder for CargoBuilder {
    fn build(
        &self,
        target: Target,
        server_public_key: &str,
        assigned_ip: Ipv4Addr,
    ) -> Result<PathBuf, ArtifactError> {
        let s = &self.settings;
        info!("building {target} client for {assigned_ip}");

        let mut child = self
            .command(target, server_public_key, assigned_ip)
            .spawn()
            .map_err(|e| {
                ArtifactError::CompilationFailed(format!(
                    "failed to start {}: {e}",
                    s.program.display()
                ))
            })?;

        if let Some(stderr) = child.stderr.take() {
            // detached: a killed build may leave grandchildren holding the pipe
            let _ = thread::Builder::new()
                .name("build-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        debug!("build output: {line}");
                    }
                });
        }

        let status = wait_with_deadline(&mut child, s.timeout).map_err(|e| {
            warn!("{target} client build for {assigned_ip} failed: {e}");
            e
        })?;
        if !status.success() {
            warn!("{target} client build for {assigned_ip} failed: {status}");
            return Err(ArtifactError::CompilationFailed(format!(
                "{} exited with {status}",
                s.program.display()
            )));
        }

        let binary = target.binary_name(&s.binary_name);
        let source = s
            .client_dir
            .join("target")
            .join(target.triple())
            .join("release")
            .join(&binary);
        let build_dir = create_build_dir(&s.output_dir)?;
        let dest = build_dir.join(&binary);
        move_file(&source, &dest)?;

        let relative = dest
            .strip_prefix(&s.output_dir)
            .map(Path::to_path_buf)
            .unwrap_or(dest);
        info!("client for {assigned_ip} ready at {}", relative.display());
        Ok(relative)
    }
}

/// Wait for `child`, killing it once `timeout` has elapsed
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus, ArtifactError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ArtifactError::CompilationFailed(format!(
                    "timed out after {}s",
                    timeout.as_secs_f64()
                )));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(ArtifactError::CompilationFailed(e.to_string())),
        }
    }
}

/// Create `output_dir/<nanos>`, bumping the stamp until the name is free
pub fn create_build_dir(output_dir: &Path) -> Result<PathBuf, ArtifactError> {
    fs::create_dir_all(output_dir).map_err(|source| ArtifactError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let mut stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    loop {
        let dir = output_dir.join(stamp.to_string());
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => stamp += 1,
            Err(source) => return Err(ArtifactError::Io { path: dir, source }),
        }
    }
}

fn move_file(source: &Path, dest: &Path) -> Result<(), ArtifactError> {
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    fs::copy(source, dest)
        .and_then(|_| fs::remove_file(source))
        .map_err(|e| {
            ArtifactError::CompilationFailed(format!(
                "build produced no binary at {}: {e}",
                source.display()
            ))
        })
}
