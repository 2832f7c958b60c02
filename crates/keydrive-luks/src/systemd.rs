//! Systemd integration.
//!
//! `systemd-cryptsetup-generator` adds `RequiresMountsFor=<key file>` to every
//! generated unlock unit. Once the keys volume is unmounted, systemd stops
//! those units and the drives keydrive just unlocked are locked again. This
//! module detects that situation and can install a generator wrapper that
//! strips the offending directive.

use crate::command::ExternalCommand;
use keydrive_core::crypttab::find_managed_drives;
use keydrive_core::error::KeydriveResult;
use keydrive_core::{HostPaths, KeydriveConfig};
use keydrive_provider::InitQuirkProbe;
use log::{debug, info};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Where systemd looks for the cryptsetup generator.
pub const CRYPTSETUP_GENERATOR: &str = "/lib/systemd/system-generators/systemd-cryptsetup-generator";

/// Normal output directory systemd hands to generators.
pub const DEFAULT_GENERATOR_OUTPUT: &str = "/run/systemd/generator";

const REQUIRES_MOUNTS_FOR: &str = "RequiresMountsFor";
const SERVICE_PREFIX: &str = "systemd-cryptsetup@";
const SERVICE_SUFFIX: &str = ".service";

/// Asks systemd whether any managed drive depends on the keys mount point.
#[derive(Debug, Clone)]
pub struct SystemdQuirkProbe {
    systemctl: String,
    paths: HostPaths,
}

impl SystemdQuirkProbe {
    pub fn new(systemctl: impl Into<String>, paths: HostPaths) -> Self {
        Self {
            systemctl: systemctl.into(),
            paths,
        }
    }

    pub fn from_config(config: &KeydriveConfig) -> Self {
        Self::new(config.tools.systemctl.clone(), config.host.clone())
    }

    fn unit_requires_mount(&self, target: &str, mount_point: &Path) -> bool {
        let unit = format!("{SERVICE_PREFIX}{target}{SERVICE_SUFFIX}");
        let output = match ExternalCommand::new(&self.systemctl)
            .arg("show")
            .arg(&unit)
            .capture()
            .silent()
            .unchecked()
            .run()
        {
            Ok(output) => output,
            Err(err) => {
                debug!("unable to query {unit}: {err}");
                return false;
            }
        };
        requires_mount_under(&output.stdout, mount_point)
    }
}

impl InitQuirkProbe for SystemdQuirkProbe {
    fn unmount_cascades(&self, mount_point: &Path) -> bool {
        debug!("checking whether systemd ties unlocked drives to {}", mount_point.display());
        let drives = match find_managed_drives(&self.paths, mount_point) {
            Ok(drives) => drives,
            Err(err) => {
                debug!("unable to read managed drives: {err}");
                return false;
            }
        };
        drives
            .iter()
            .any(|drive| self.unit_requires_mount(&drive.target, mount_point))
    }
}

/// True when a `RequiresMountsFor=` line of `systemctl show` output names a path under `mount_point`.
fn requires_mount_under(show_output: &str, mount_point: &Path) -> bool {
    show_output.lines().any(|line| {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        key.trim() == REQUIRES_MOUNTS_FOR
            && value
                .split_whitespace()
                .any(|path| Path::new(path).starts_with(mount_point))
    })
}

/// Location of the cryptsetup generator and of the original it wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorPaths {
    pub generator: PathBuf,
    pub wrapped: PathBuf,
}

impl Default for GeneratorPaths {
    fn default() -> Self {
        Self::at(CRYPTSETUP_GENERATOR)
    }
}

impl GeneratorPaths {
    /// Paths for a generator installed at `generator`; the original moves to `<generator>-original`.
    pub fn at(generator: impl Into<PathBuf>) -> Self {
        let generator = generator.into();
        let mut wrapped = generator.clone().into_os_string();
        wrapped.push("-original");
        Self {
            generator,
            wrapped: PathBuf::from(wrapped),
        }
    }

    /// Whether `generator` is already a symlink to `program`.
    pub fn workaround_installed(&self, program: &Path) -> bool {
        fs::read_link(&self.generator).is_ok_and(|target| target == program)
    }

    /// Whether this process was started under the generator's file name.
    pub fn workaround_requested(&self, argv0: &OsStr) -> bool {
        match (Path::new(argv0).file_name(), self.generator.file_name()) {
            (Some(invoked), Some(generator)) => invoked == generator,
            _ => false,
        }
    }
}

/// Put `program` in place of the cryptsetup generator.
///
/// A regular file at the generator path is the upstream program and is moved
/// over the wrapped copy, so a package upgrade refreshes it. A foreign
/// symlink is replaced. Returns `false` when the workaround was already in
/// place.
pub fn install_systemd_workaround(paths: &GeneratorPaths, program: &Path) -> KeydriveResult<bool> {
    if paths.workaround_installed(program) {
        debug!("workaround for systemd incompatibility is installed");
        return Ok(false);
    }

    info!("installing workaround for systemd incompatibility");
    match fs::symlink_metadata(&paths.generator) {
        Ok(meta) if meta.file_type().is_symlink() => {
            debug!("replacing symlink {}", paths.generator.display());
            fs::remove_file(&paths.generator)?;
        }
        Ok(_) => {
            info!(
                "moving {} to {}",
                paths.generator.display(),
                paths.wrapped.display()
            );
            fs::rename(&paths.generator, &paths.wrapped)?;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    symlink(program, &paths.generator)?;
    info!("successfully installed workaround");
    Ok(true)
}

/// Run the wrapped generator with `args`, then strip the mount dependency from its output.
///
/// Returns the number of unit files rewritten.
pub fn update_systemd_services(
    paths: &GeneratorPaths,
    args: &[OsString],
    elevate: bool,
) -> KeydriveResult<usize> {
    info!("running {} ..", paths.wrapped.display());
    ExternalCommand::new(paths.wrapped.to_string_lossy())
        .args(args)
        .elevated(elevate)
        .run()?;

    let output_dir = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_GENERATOR_OUTPUT));
    strip_requires_mounts_for(&output_dir)
}

/// Drop `RequiresMountsFor=` from every generated cryptsetup unit in `dir`.
pub fn strip_requires_mounts_for(dir: &Path) -> KeydriveResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut units: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_cryptsetup_unit(path) && path.is_file())
        .collect();
    units.sort();

    let mut rewritten = 0;
    for unit in units {
        debug!("reading {}", unit.display());
        let contents = fs::read_to_string(&unit)?;
        if let Some(stripped) = strip_directive(&contents) {
            info!("saving {}", unit.display());
            fs::write(&unit, stripped)?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

fn is_cryptsetup_unit(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.starts_with(SERVICE_PREFIX) && name.ends_with(SERVICE_SUFFIX))
}

/// Return `contents` without `RequiresMountsFor=` lines, or `None` if there were none.
fn strip_directive(contents: &str) -> Option<String> {
    let mut changed = false;
    let kept: String = contents
        .split_inclusive('\n')
        .filter(|line| {
            let is_directive = line
                .split_once('=')
                .is_some_and(|(key, _)| key.trim() == REQUIRES_MOUNTS_FOR);
            if is_directive {
                info!("stripping line: {}", line.trim());
                changed = true;
            }
            !is_directive
        })
        .collect();
    changed.then_some(kept)
}
