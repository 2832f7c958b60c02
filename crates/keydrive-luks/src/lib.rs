#![forbid(unsafe_code)]

//! Host integration for keydrive.
//!
//! Talks to the machine through external programs:
//! - `cryptsetup` and `cryptdisks_start` for containers, key slots and mappings
//! - `mkfs.ext4`, `mount`, `umount` and `blkid` for filesystems
//! - `systemctl` and the systemd cryptsetup generator for the unmount quirk

mod command;
pub mod systemd;
mod system;

pub use systemd::{GeneratorPaths, SystemdQuirkProbe};
pub use system::SystemToolchain;
