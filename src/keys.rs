//! WireGuard key material
//!
//! Keys travel as standard base64 of their 32 raw bytes, the same encoding
//! `wg genkey` / `wg pubkey` use. The server private key is the only secret
//! written to disk; it is created once and never overwritten implicitly.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::KeyError;

/// Raw key length in bytes
pub const KEY_LEN: usize = 32;

/// Private/public key pair, both base64-encoded
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a fresh key pair from the OS entropy source.
///
/// The private scalar is clamped the way `wg genkey` clamps it.
pub fn generate_key_pair() -> Result<KeyPair, KeyError> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(KeyPair {
        private_key: general_purpose::STANDARD.encode(secret.to_bytes()),
        public_key: general_purpose::STANDARD.encode(public.as_bytes()),
    })
}

/// Derive the public key belonging to a base64 private key
pub fn public_key_from_private(private_b64: &str) -> Result<String, KeyError> {
    let bytes = decode_key(private_b64)?;
    let secret = StaticSecret::from(bytes);
    Ok(general_purpose::STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Validate that a base64 public key decodes to 32 bytes
pub fn validate_public_key_b64(b64: &str) -> Result<(), KeyError> {
    decode_key(b64).map(|_| ())
}

/// Decode a base64 key into its raw bytes
pub fn decode_key(b64: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| KeyError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", b.len())))
}

/// Write `key` to `directory/filename`, creating the directory as needed.
///
/// The file is created exclusively and, on Unix, readable by the owner
/// only. An existing file is never replaced.
pub fn persist_private_key(
    directory: &Path,
    filename: &str,
    key: &str,
) -> Result<PathBuf, KeyError> {
    let path = directory.join(filename);
    fs::create_dir_all(directory).map_err(|source| KeyError::Io {
        path: directory.to_path_buf(),
        source,
    })?;

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            KeyError::AlreadyExists(path.clone())
        } else {
            KeyError::Io {
                path: path.clone(),
                source,
            }
        }
    })?;
    file.write_all(key.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|source| KeyError::Io {
            path: path.clone(),
            source,
        })?;

    debug!("private key written to {}", path.display());
    Ok(path)
}

/// Read and validate a private key file
pub fn load_private_key(path: &Path) -> Result<String, KeyError> {
    let contents = fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let key = contents.trim().to_string();
    decode_key(&key)?;
    Ok(key)
}

/// Reuse the key stored at `directory/filename`, or generate and persist a
/// new one. The flag is `true` when a key was generated.
pub fn load_or_generate(directory: &Path, filename: &str) -> Result<(KeyPair, bool), KeyError> {
    let path = directory.join(filename);
    if path.exists() {
        let private_key = load_private_key(&path)?;
        let public_key = public_key_from_private(&private_key)?;
        info!("loaded server key from {}", path.display());
        return Ok((
            KeyPair {
                private_key,
                public_key,
            },
            false,
        ));
    }

    let pair = generate_key_pair()?;
    persist_private_key(directory, filename, &pair.private_key)?;
    info!("generated server key, stored in {}", path.display());
    Ok((pair, true))
}
