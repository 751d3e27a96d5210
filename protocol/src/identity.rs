//! Key-file handling
//!
//! The signing key lives in a small base64-encoded file, created on
//! first use with owner-read-only permissions. The rest of the crate
//! treats the loaded key as an opaque capability to sign records and
//! self-identify as one public key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use std::path::Path;
use tracing::info;

use crate::error::MeshError;

/// Load the signing key from `path`, generating and persisting a new
/// one if the file does not exist yet.
///
/// An existing file that does not decode to a valid key is a fatal
/// configuration error; silently generating a fresh identity would
/// split this node from records it already published.
pub fn load_or_generate(path: &Path) -> Result<SigningKey, MeshError> {
    if path.exists() {
        return load(path);
    }

    let key = SigningKey::from_bytes(&rand::random());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, BASE64.encode(key.to_bytes()))?;
    restrict_permissions(path)?;
    info!(path = %path.display(), "generated new signing key");
    Ok(key)
}

/// Load an existing base64-encoded signing key.
pub fn load(path: &Path) -> Result<SigningKey, MeshError> {
    let encoded = std::fs::read_to_string(path)?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| MeshError::InvalidKey(format!("{}: {e}", path.display())))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MeshError::InvalidKey(format!("{}: key must be 32 bytes", path.display())))?;
    Ok(SigningKey::from_bytes(&bytes))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
