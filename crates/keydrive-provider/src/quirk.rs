//! Init-system probe consulted before tearing the keys volume down.

use std::path::Path;

/// Answers whether unmounting the keys volume would drag managed drives down with it.
///
/// Some init systems record a mount dependency from every unlocked volume to
/// the location of its key file. On those hosts unmounting the keys volume
/// immediately unmounts and locks the drives that were just unlocked.
pub trait InitQuirkProbe {
    /// Return `true` when unmounting `mount_point` would cascade to managed drives.
    fn unmount_cascades(&self, mount_point: &Path) -> bool;
}

/// Probe for hosts without the quirk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuirk;

impl InitQuirkProbe for NoQuirk {
    fn unmount_cascades(&self, _mount_point: &Path) -> bool {
        false
    }
}
