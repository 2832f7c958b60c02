//! Turns `crypttab` source locators into concrete block devices.

use crate::config::HostPaths;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolves `<KIND>=<value>` locators against the udev symlink directories.
#[derive(Debug, Clone, Copy)]
pub struct DeviceResolver<'a> {
    paths: &'a HostPaths,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(paths: &'a HostPaths) -> Self {
        Self { paths }
    }

    /// Return the real device path behind `locator`, or `None` when it is not present.
    pub fn resolve(&self, locator: &str) -> Option<PathBuf> {
        let trimmed = locator.trim();
        if trimmed.starts_with('/') {
            return canonicalize_existing(Path::new(trimmed));
        }

        let (kind, value) = trimmed.split_once('=')?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        let link = if kind.eq_ignore_ascii_case("UUID") {
            self.paths.disk_by_uuid_dir.join(value.to_ascii_lowercase())
        } else if kind.eq_ignore_ascii_case("PARTUUID") {
            self.paths
                .disk_by_partuuid_dir
                .join(value.to_ascii_lowercase())
        } else if kind.eq_ignore_ascii_case("LABEL") {
            self.paths.disk_by_label_dir.join(value)
        } else {
            return None;
        };

        canonicalize_existing(&link)
    }
}

fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }
    fs::canonicalize(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn host_paths(root: &Path) -> HostPaths {
        let paths = HostPaths {
            disk_by_uuid_dir: root.join("by-uuid"),
            disk_by_label_dir: root.join("by-label"),
            disk_by_partuuid_dir: root.join("by-partuuid"),
            ..HostPaths::default()
        };
        fs::create_dir_all(&paths.disk_by_uuid_dir).unwrap();
        fs::create_dir_all(&paths.disk_by_label_dir).unwrap();
        fs::create_dir_all(&paths.disk_by_partuuid_dir).unwrap();
        paths
    }

    #[test]
    fn uuid_lookup_is_case_insensitive_and_follows_links() {
        let dir = tempdir().unwrap();
        let paths = host_paths(dir.path());
        let device = dir.path().join("sdb1");
        fs::write(&device, b"").unwrap();
        symlink(&device, paths.disk_by_uuid_dir.join("0a1b2c3d-aaaa")).unwrap();

        let resolver = DeviceResolver::new(&paths);
        let expected = fs::canonicalize(&device).unwrap();
        assert_eq!(resolver.resolve("UUID=0A1B2C3D-AAAA"), Some(expected.clone()));
        assert_eq!(resolver.resolve("uuid=0a1b2c3d-aaaa"), Some(expected));
    }

    #[test]
    fn missing_or_dangling_links_are_unavailable() {
        let dir = tempdir().unwrap();
        let paths = host_paths(dir.path());
        symlink(
            dir.path().join("gone"),
            paths.disk_by_uuid_dir.join("dangling"),
        )
        .unwrap();

        let resolver = DeviceResolver::new(&paths);
        assert_eq!(resolver.resolve("UUID=absent"), None);
        assert_eq!(resolver.resolve("UUID=dangling"), None);
        assert_eq!(resolver.resolve("UUID="), None);
        assert_eq!(resolver.resolve("no-kind-here"), None);
        assert_eq!(resolver.resolve("ID=whatever"), None);
    }

    #[test]
    fn label_partuuid_and_plain_paths_resolve() {
        let dir = tempdir().unwrap();
        let paths = host_paths(dir.path());
        let device = dir.path().join("nvme0n1p2");
        fs::write(&device, b"").unwrap();
        let expected = fs::canonicalize(&device).unwrap();
        symlink(&device, paths.disk_by_label_dir.join("Backup")).unwrap();
        symlink(&device, paths.disk_by_partuuid_dir.join("deadbeef-02")).unwrap();

        let resolver = DeviceResolver::new(&paths);
        assert_eq!(resolver.resolve("LABEL=Backup"), Some(expected.clone()));
        assert_eq!(resolver.resolve("LABEL=backup"), None);
        assert_eq!(resolver.resolve("PARTUUID=DEADBEEF-02"), Some(expected.clone()));
        assert_eq!(
            resolver.resolve(&device.to_string_lossy()),
            Some(expected)
        );
    }
}
