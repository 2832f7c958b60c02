//! Contract for the external disk-encryption and filesystem toolchain.
//!
//! Every operation blocks until the underlying program exits. Pass-phrase
//! prompts happen inside the toolchain and may wait on the operator for as
//! long as it takes.

use std::error::Error;
use std::path::Path;

/// Abstraction over container, key-slot, filesystem and mount commands.
pub trait VolumeToolchain {
    type Error: Error + Send + Sync + 'static;

    /// Format `image` as a LUKS container (prompts for the new pass-phrase).
    fn format_container(&self, image: &Path) -> Result<(), Self::Error>;

    /// Unlock the container at `image` as `/dev/mapper/<name>`.
    fn open_container(&self, image: &Path, name: &str) -> Result<(), Self::Error>;

    /// Lock the mapping called `name`.
    fn close_container(&self, name: &str) -> Result<(), Self::Error>;

    /// Add the contents of `key_file` as a new key slot on `device`.
    fn add_key(&self, device: &Path, key_file: &Path) -> Result<(), Self::Error>;

    /// Unlock a declared volume by its target name.
    ///
    /// The toolchain looks the target up in the volume-declaration file itself.
    fn start_mapping(&self, name: &str) -> Result<(), Self::Error>;

    /// Create a filesystem on `device`.
    fn create_filesystem(&self, device: &Path) -> Result<(), Self::Error>;

    /// Mount `device`, either at `target` or wherever the fstab says.
    fn mount(&self, device: &Path, target: Option<&Path>) -> Result<(), Self::Error>;

    /// Unmount whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<(), Self::Error>;

    /// Return the `TYPE` reported by block-device metadata for `device`, if any.
    fn block_device_type(&self, device: &Path) -> Result<Option<String>, Self::Error>;
}
