//! Mount-table inspection.

use crate::error::KeydriveResult;
use crate::tabfile::read_tab_file;
use keydrive_provider::VolumeToolchain;
use log::debug;
use std::path::{Path, PathBuf};

/// Block-device type reported for LVM physical volumes.
const LVM_MEMBER_TYPE: &str = "lvm2_member";

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: Option<PathBuf>,
}

/// Snapshot of the mount table, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read the table at `path`; a missing file is an empty table.
    pub fn read(path: &Path) -> KeydriveResult<Self> {
        let entries = read_tab_file(path)?
            .into_iter()
            .map(|tokens| {
                let mut fields = tokens.into_iter();
                let device = fields.next().unwrap_or_default();
                let mount_point = fields
                    .next()
                    .map(|field| PathBuf::from(unescape_mount_field(&field)));
                MountEntry {
                    device,
                    mount_point,
                }
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Whether `device` is the source of any mounted filesystem.
    pub fn contains_device(&self, device: &Path) -> bool {
        self.entries
            .iter()
            .any(|entry| Path::new(&entry.device) == device)
    }

    /// Whether something is mounted at `target`.
    pub fn is_mount_point(&self, target: &Path) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.mount_point.as_deref() == Some(target))
    }
}

/// Why a mapper device does or does not need a mount command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountDecision {
    Mount,
    AlreadyMounted,
    VolumeGroupMember,
}

impl MountDecision {
    pub fn needs_mount(self) -> bool {
        matches!(self, MountDecision::Mount)
    }
}

/// Decide whether `mapper_device` should be mounted now.
///
/// Evaluated fresh on every call; nothing is cached between activations.
pub fn inspect_mount_state<T: VolumeToolchain>(
    toolchain: &T,
    mtab_path: &Path,
    mapper_device: &Path,
) -> KeydriveResult<MountDecision> {
    if MountTable::read(mtab_path)?.contains_device(mapper_device) {
        debug!("drive {} is already mounted", mapper_device.display());
        return Ok(MountDecision::AlreadyMounted);
    }

    match toolchain.block_device_type(mapper_device) {
        Ok(Some(kind)) if kind.eq_ignore_ascii_case(LVM_MEMBER_TYPE) => {
            debug!(
                "drive {} is part of an LVM volume group; not mounting it",
                mapper_device.display()
            );
            return Ok(MountDecision::VolumeGroupMember);
        }
        Ok(_) => {}
        Err(err) => debug!(
            "block device query for {} failed ({err}); assuming a plain filesystem",
            mapper_device.display()
        ),
    }

    debug!("drive {} not yet mounted", mapper_device.display());
    Ok(MountDecision::Mount)
}

/// Boolean shorthand for [`inspect_mount_state`].
pub fn drive_needs_mounting<T: VolumeToolchain>(
    toolchain: &T,
    mtab_path: &Path,
    mapper_device: &Path,
) -> KeydriveResult<bool> {
    Ok(inspect_mount_state(toolchain, mtab_path, mapper_device)?.needs_mount())
}

fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}
