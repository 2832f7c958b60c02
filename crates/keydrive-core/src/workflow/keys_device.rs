//! Keys-volume orchestration.
//!
//! One call to [`initialize_keys_device`] provisions or opens the keys
//! container, mounts it, activates every managed drive and then unwinds in
//! reverse order: unmount, then lock. A first run that fails before the
//! container has a filesystem deletes the half-built image again.

use super::activate::DriveActivator;
use super::guard::ScopedRelease;
use super::{emit, pluralize, WorkflowLevel, WorkflowObserver};
use crate::cancel::CancelToken;
use crate::config::{HostPaths, KeysDeviceCfg};
use crate::crypttab::find_managed_drives;
use crate::error::{KeydriveError, KeydriveResult};
use crate::mounts::MountTable;
use keydrive_provider::{InitQuirkProbe, VolumeToolchain};
use log::warn;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Size of a freshly provisioned keys image.
pub const IMAGE_SIZE: u64 = 10 * 1024 * 1024;

const IMAGE_CHUNK: usize = 1024 * 1024;

/// What to open and which drives to activate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysDeviceOptions {
    pub image_file: PathBuf,
    pub mapper_name: String,
    pub mount_point: PathBuf,
    /// Restrict activation to these targets; empty means all managed drives.
    pub volumes: Vec<String>,
    /// Tear the keys volume down afterwards; `None` asks the init-system probe.
    pub cleanup: Option<bool>,
}

impl KeysDeviceOptions {
    pub fn from_config(cfg: &KeysDeviceCfg) -> Self {
        Self {
            image_file: cfg.image_file.clone(),
            mapper_name: cfg.mapper_name.clone(),
            mount_point: cfg.mount_point.clone(),
            volumes: Vec::new(),
            cleanup: cfg.cleanup,
        }
    }
}

/// Host collaborators used by one run.
pub struct Environment<'a, T, Q: ?Sized> {
    pub paths: &'a HostPaths,
    pub toolchain: &'a T,
    pub quirk: &'a Q,
    pub cancel: &'a CancelToken,
}

/// Tally of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeysDeviceSummary {
    pub first_run: bool,
    pub cleanup: bool,
    pub configured: usize,
    pub available: usize,
    pub unlocked: usize,
    pub keys_installed: usize,
    pub mounted: usize,
    /// Available drives where a key install, unlock or mount failed.
    pub failed: usize,
}

impl KeysDeviceSummary {
    fn message(&self, mount_point: &Path) -> (WorkflowLevel, String) {
        let mut counts = format!(
            "configured={}, available={}, unlocked={}",
            self.configured, self.available, self.unlocked
        );
        if self.failed > 0 {
            counts.push_str(&format!(", failed={}", self.failed));
        }
        if self.configured == 0 {
            (
                WorkflowLevel::Warn,
                format!(
                    "No encrypted drives are configured to use key files under {} ({counts}).",
                    mount_point.display()
                ),
            )
        } else if self.available == 0 {
            (
                WorkflowLevel::Warn,
                format!("None of the configured drives are currently available ({counts})."),
            )
        } else if self.failed > 0 {
            (
                WorkflowLevel::Warn,
                format!(
                    "Could not fully activate {}; unlocked {} ({counts}).",
                    pluralize(self.failed, "encrypted drive"),
                    pluralize(self.unlocked, "drive")
                ),
            )
        } else if self.unlocked == 0 && self.keys_installed > 0 {
            (
                WorkflowLevel::Info,
                format!(
                    "Installed new keys on {}; all available drives were already unlocked ({counts}).",
                    pluralize(self.keys_installed, "drive")
                ),
            )
        } else if self.unlocked == 0 {
            (
                WorkflowLevel::Info,
                format!(
                    "Nothing to do: all {} already unlocked ({counts}).",
                    pluralize(self.available, "available drive")
                ),
            )
        } else {
            (
                WorkflowLevel::Success,
                format!(
                    "Unlocked {} just now ({counts}).",
                    pluralize(self.unlocked, "encrypted drive")
                ),
            )
        }
    }
}

/// State of the keys container for one invocation.
struct KeysVolumeSession {
    image_file: PathBuf,
    mapper_name: String,
    mount_point: PathBuf,
    volumes: Vec<String>,
    first_run: bool,
    rollback: ImageRollback,
    cleanup: bool,
}

/// Deletes a freshly created image unless provisioning got as far as a filesystem.
///
/// The normal path calls [`ImageRollback::run`] to report through the
/// observer; `Drop` covers unwinding.
struct ImageRollback {
    image_file: PathBuf,
    armed: bool,
}

impl ImageRollback {
    fn new(image_file: PathBuf, armed: bool) -> Self {
        Self { image_file, armed }
    }

    fn keep(&mut self) {
        self.armed = false;
    }

    fn run(&mut self, observer: &mut dyn WorkflowObserver) {
        if !std::mem::take(&mut self.armed) {
            return;
        }
        emit(
            observer,
            WorkflowLevel::Warn,
            format!(
                "Initialization procedure was interrupted, deleting {} ..",
                self.image_file.display()
            ),
        );
        if let Err(err) = remove_image(&self.image_file) {
            emit(
                observer,
                WorkflowLevel::Error,
                format!("Failed to delete {}: {err}", self.image_file.display()),
            );
        }
    }
}

impl Drop for ImageRollback {
    fn drop(&mut self) {
        if std::mem::take(&mut self.armed) {
            warn!(
                "initialization procedure was interrupted, deleting {}",
                self.image_file.display()
            );
            if let Err(err) = remove_image(&self.image_file) {
                warn!("failed to delete {}: {err}", self.image_file.display());
            }
        }
    }
}

fn remove_image(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Open (or provision) the keys volume and use it to unlock every managed drive.
pub fn initialize_keys_device<T, Q>(
    env: &Environment<'_, T, Q>,
    options: &KeysDeviceOptions,
    observer: &mut dyn WorkflowObserver,
) -> KeydriveResult<KeysDeviceSummary>
where
    T: VolumeToolchain<Error = KeydriveError>,
    Q: InitQuirkProbe + ?Sized,
{
    let mut session = KeysVolumeSession::begin(env, options, observer);
    let outcome = session.run(env, observer);
    session.rollback.run(observer);

    // An interrupt is fatal even when the step it hit reported success.
    if env.cancel.is_cancelled() {
        return Err(KeydriveError::Cancelled);
    }
    outcome
}

impl KeysVolumeSession {
    fn begin<T, Q>(
        env: &Environment<'_, T, Q>,
        options: &KeysDeviceOptions,
        observer: &mut dyn WorkflowObserver,
    ) -> Self
    where
        Q: InitQuirkProbe + ?Sized,
    {
        let first_run = !options.image_file.is_file();
        let cleanup = match options.cleanup {
            Some(explicit) => explicit,
            None if env.quirk.unmount_cascades(&options.mount_point) => {
                emit(
                    observer,
                    WorkflowLevel::Warn,
                    format!(
                        "Unmounting {} would also lock the drives it unlocks; leaving the keys device mounted and unlocked.",
                        options.mount_point.display()
                    ),
                );
                false
            }
            None => true,
        };

        Self {
            image_file: options.image_file.clone(),
            mapper_name: options.mapper_name.clone(),
            mount_point: options.mount_point.clone(),
            volumes: options.volumes.clone(),
            first_run,
            rollback: ImageRollback::new(options.image_file.clone(), first_run),
            cleanup,
        }
    }

    fn run<T, Q>(
        &mut self,
        env: &Environment<'_, T, Q>,
        observer: &mut dyn WorkflowObserver,
    ) -> KeydriveResult<KeysDeviceSummary>
    where
        T: VolumeToolchain<Error = KeydriveError>,
        Q: ?Sized,
    {
        let toolchain = env.toolchain;
        let mapper_device = env.paths.mapper_device(&self.mapper_name);

        if self.first_run {
            emit(
                observer,
                WorkflowLevel::Info,
                format!("Creating virtual keys device {} ..", self.image_file.display()),
            );
            create_zeroed_image(&self.image_file, IMAGE_SIZE)?;
            env.cancel.checkpoint()?;
            toolchain.format_container(&self.image_file)?;
        }
        env.cancel.checkpoint()?;

        if !env.paths.mapping_exists(&self.mapper_name) {
            emit(
                observer,
                WorkflowLevel::Info,
                format!("Unlocking virtual keys device {} ..", self.image_file.display()),
            );
            toolchain.open_container(&self.image_file, &self.mapper_name)?;
        }
        let unlocked_at = Instant::now();

        let mapper_name = self.mapper_name.clone();
        let lock = ScopedRelease::new(
            self.cleanup,
            format!("lock virtual keys device {mapper_name}"),
            move || toolchain.close_container(&mapper_name),
        );
        env.cancel.checkpoint()?;

        if self.first_run {
            emit(
                observer,
                WorkflowLevel::Info,
                "Creating file system on virtual keys device ..",
            );
            toolchain.create_filesystem(&mapper_device)?;
            self.rollback.keep();
        }

        emit(observer, WorkflowLevel::Info, "Mounting virtual keys device ..");
        fs::create_dir_all(&self.mount_point)?;
        if !MountTable::read(&env.paths.mtab_path)?.is_mount_point(&self.mount_point) {
            toolchain.mount(&mapper_device, Some(&self.mount_point))?;
        }

        let mount_point = self.mount_point.clone();
        let unmount = ScopedRelease::new(
            self.cleanup,
            format!("unmount {}", mount_point.display()),
            move || toolchain.unmount(&mount_point),
        );

        fs::set_permissions(&self.mount_point, fs::Permissions::from_mode(0o700))?;
        let summary = self.activate_managed_drives(env, observer)?;
        let (level, message) = summary.message(&self.mount_point);
        emit(observer, level, message);

        if unmount.is_armed() {
            emit(
                observer,
                WorkflowLevel::Info,
                format!("Unmounting {} ..", self.mount_point.display()),
            );
        }
        unmount.finish()?;

        if lock.is_armed() {
            emit(observer, WorkflowLevel::Info, "Locking virtual keys device ..");
            lock.finish()?;
            emit(
                observer,
                WorkflowLevel::Debug,
                format!(
                    "Virtual keys device was accessible for {:.2?}.",
                    unlocked_at.elapsed()
                ),
            );
        } else {
            emit(
                observer,
                WorkflowLevel::Info,
                format!(
                    "Leaving virtual keys device mounted at {}.",
                    self.mount_point.display()
                ),
            );
        }

        Ok(summary)
    }

    fn activate_managed_drives<T, Q>(
        &self,
        env: &Environment<'_, T, Q>,
        observer: &mut dyn WorkflowObserver,
    ) -> KeydriveResult<KeysDeviceSummary>
    where
        T: VolumeToolchain<Error = KeydriveError>,
        Q: ?Sized,
    {
        let activator = DriveActivator::new(env.toolchain, env.paths);
        let mut summary = KeysDeviceSummary {
            first_run: self.first_run,
            cleanup: self.cleanup,
            ..KeysDeviceSummary::default()
        };

        for drive in find_managed_drives(env.paths, &self.mount_point)? {
            env.cancel.checkpoint()?;

            if !self.volumes.is_empty() && !self.volumes.contains(&drive.target) {
                emit(
                    observer,
                    WorkflowLevel::Debug,
                    format!("Skipping {} (not among the requested volumes).", drive.target),
                );
                continue;
            }
            summary.configured += 1;

            let Some(device) = drive.resolved_source_device.as_deref() else {
                emit(
                    observer,
                    WorkflowLevel::Debug,
                    format!(
                        "Skipping {} (source {} is not available).",
                        drive.target, drive.source_locator
                    ),
                );
                continue;
            };
            summary.available += 1;

            let outcome = activator.activate_encrypted_drive(
                observer,
                &drive.target,
                device,
                &self.mount_point,
                self.first_run,
            )?;
            if outcome.is_noop() {
                emit(
                    observer,
                    WorkflowLevel::Debug,
                    format!("Encrypted drive {} is already active.", drive.target),
                );
            }
            summary.keys_installed += usize::from(outcome.key_installed);
            summary.unlocked += usize::from(outcome.unlocked);
            summary.mounted += usize::from(outcome.mounted);
            summary.failed += usize::from(outcome.failed);
        }

        Ok(summary)
    }
}

/// Write `size` zero bytes to a new file at `path`.
fn create_zeroed_image(path: &Path, size: u64) -> KeydriveResult<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let chunk = vec![0u8; IMAGE_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let len = remaining.min(IMAGE_CHUNK as u64) as usize;
        file.write_all(&chunk[..len])?;
        remaining -= len as u64;
    }
    file.sync_all()?;
    Ok(())
}
