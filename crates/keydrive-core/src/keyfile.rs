//! Generation and persistence of per-volume key files.

use crate::error::{KeydriveError, KeydriveResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Size of every generated key file in bytes.
pub const KEY_FILE_SIZE: usize = 4096;

/// Key files end up readable by their owner only.
pub const KEY_FILE_MODE: u32 = 0o400;

/// Fill `path` with fresh random key material, replacing any previous key.
///
/// The file is written next to its destination and renamed into place, so a
/// crash never leaves a truncated key behind. Returns the SHA-256 digest of
/// the new key in hex.
pub fn generate_key_file(path: &Path) -> KeydriveResult<String> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut key = Zeroizing::new(vec![0u8; KEY_FILE_SIZE]);
    OsRng
        .try_fill_bytes(&mut key[..])
        .map_err(|err| key_error(path, format!("random source failed: {err}")))?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(&key[..])?;
    temp.as_file_mut().flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|err| key_error(path, err.error.to_string()))?;

    Ok(hex::encode(Sha256::digest(&key[..])))
}

/// Restrict `path` to owner-read-only.
pub fn restrict_permissions(path: &Path) -> KeydriveResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
    Ok(())
}

fn key_error(path: &Path, reason: impl Into<String>) -> KeydriveError {
    KeydriveError::KeyFile {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
