//! Per-drive activation: key file, key slot, mapping, mount.

use super::{emit, WorkflowLevel, WorkflowObserver};
use crate::config::HostPaths;
use crate::error::{KeydriveError, KeydriveResult};
use crate::keyfile::{generate_key_file, restrict_permissions};
use crate::mounts::{inspect_mount_state, MountDecision};
use keydrive_provider::VolumeToolchain;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Which sub-steps actually ran for one drive.
///
/// All `false` means the drive was already fully active. `failed` is set
/// when a key install, unlock or mount was attempted and did not succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveActivation {
    pub key_installed: bool,
    pub unlocked: bool,
    pub mounted: bool,
    pub failed: bool,
}

impl DriveActivation {
    pub fn is_noop(&self) -> bool {
        !(self.key_installed || self.unlocked || self.mounted || self.failed)
    }
}

/// Brings one declared volume from "locked" to "unlocked and mounted".
///
/// Every step is skipped when its effect is already in place, so activating
/// an active drive is a no-op. Failures to install a key, unlock or mount a
/// single drive are reported as warnings and leave the matching flag unset;
/// only failures touching the keys volume itself are returned as errors.
pub struct DriveActivator<'a, T> {
    toolchain: &'a T,
    paths: &'a HostPaths,
}

impl<'a, T> DriveActivator<'a, T>
where
    T: VolumeToolchain<Error = KeydriveError>,
{
    pub fn new(toolchain: &'a T, paths: &'a HostPaths) -> Self {
        Self { toolchain, paths }
    }

    /// Activate `mapper_name`, backed by `physical_device`, with a key from `keys_directory`.
    ///
    /// With `reset` the key file is regenerated and enrolled even if one exists.
    pub fn activate_encrypted_drive(
        &self,
        observer: &mut dyn WorkflowObserver,
        mapper_name: &str,
        physical_device: &Path,
        keys_directory: &Path,
        reset: bool,
    ) -> KeydriveResult<DriveActivation> {
        let mut result = DriveActivation::default();
        let mapper_device = self.paths.mapper_device(mapper_name);
        let device_exists = mapper_device.exists();

        if reset || !device_exists {
            let key_file = keys_directory.join(format!("{mapper_name}.key"));
            if reset || !key_file.is_file() {
                emit(
                    observer,
                    WorkflowLevel::Info,
                    format!(
                        "Creating {} to unlock {mapper_name} ({}) ..",
                        key_file.display(),
                        physical_device.display()
                    ),
                );
                let digest = generate_key_file(&key_file)?;
                emit(
                    observer,
                    WorkflowLevel::Debug,
                    format!("Key file {} has SHA-256 {digest}", key_file.display()),
                );

                emit(
                    observer,
                    WorkflowLevel::Info,
                    format!(
                        "Installing {} on {} ..",
                        key_file.display(),
                        physical_device.display()
                    ),
                );
                if let Err(err) = self.toolchain.add_key(physical_device, &key_file) {
                    emit(
                        observer,
                        WorkflowLevel::Warn,
                        format!(
                            "Failed to install key on {} for {mapper_name}: {err}",
                            physical_device.display()
                        ),
                    );
                    discard_key_file(observer, &key_file);
                    result.failed = true;
                    return Ok(result);
                }
                result.key_installed = true;
            }

            restrict_permissions(&key_file)?;

            if !device_exists {
                emit(
                    observer,
                    WorkflowLevel::Info,
                    format!("Unlocking encrypted drive {mapper_name} .."),
                );
                if let Err(err) = self.toolchain.start_mapping(mapper_name) {
                    emit(
                        observer,
                        WorkflowLevel::Warn,
                        format!("Failed to unlock encrypted drive {mapper_name}: {err}"),
                    );
                    result.failed = true;
                    return Ok(result);
                }
                result.unlocked = true;
            }
        }

        match inspect_mount_state(self.toolchain, &self.paths.mtab_path, &mapper_device)? {
            MountDecision::Mount => {
                emit(
                    observer,
                    WorkflowLevel::Info,
                    format!("Mounting {} ..", mapper_device.display()),
                );
                match self.toolchain.mount(&mapper_device, None) {
                    Ok(()) => result.mounted = true,
                    Err(err) => {
                        emit(
                            observer,
                            WorkflowLevel::Warn,
                            format!("Failed to mount {}: {err}", mapper_device.display()),
                        );
                        result.failed = true;
                    }
                }
            }
            MountDecision::AlreadyMounted => emit(
                observer,
                WorkflowLevel::Debug,
                format!("Drive {} is already mounted.", mapper_device.display()),
            ),
            MountDecision::VolumeGroupMember => emit(
                observer,
                WorkflowLevel::Debug,
                format!(
                    "Drive {} is part of an LVM volume group so it won't be mounted.",
                    mapper_device.display()
                ),
            ),
        }

        Ok(result)
    }
}

/// Remove a key that never made it into a key slot so the next run starts over.
fn discard_key_file(observer: &mut dyn WorkflowObserver, key_file: &Path) {
    match fs::remove_file(key_file) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => emit(
            observer,
            WorkflowLevel::Warn,
            format!("Failed to remove unused key {}: {err}", key_file.display()),
        ),
    }
}
