//! `crypttab` modelling and managed-drive discovery.

use crate::config::HostPaths;
use crate::error::KeydriveResult;
use crate::resolver::DeviceResolver;
use crate::tabfile::{read_tab_file, tokenize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Sentinel used in the key-file column for "no key file".
const NO_KEY_FILE: &str = "none";

/// One declared encrypted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedVolumeEntry {
    /// Mapping name; the unlocked device appears as `/dev/mapper/<target>`.
    pub target: String,
    /// Source locator as written (`UUID=...`, `LABEL=...`, `/dev/...`).
    pub source_locator: String,
    pub key_file_path: Option<PathBuf>,
    pub option_flags: BTreeSet<String>,
    /// Concrete device behind `source_locator`; `None` while the device is absent.
    pub resolved_source_device: Option<PathBuf>,
}

impl ManagedVolumeEntry {
    /// Build an entry from a tokenized line; anything but four fields yields `None`.
    pub fn from_tokens(tokens: &[String]) -> Option<Self> {
        let [target, source, key, options] = tokens else {
            return None;
        };

        let key_file_path = (key != NO_KEY_FILE).then(|| PathBuf::from(key));
        let option_flags = options
            .split(',')
            .filter(|flag| !flag.is_empty())
            .map(str::to_string)
            .collect();

        Some(Self {
            target: target.clone(),
            source_locator: source.clone(),
            key_file_path,
            option_flags,
            resolved_source_device: None,
        })
    }

    pub fn is_available(&self) -> bool {
        self.resolved_source_device.is_some()
    }

    pub fn is_luks(&self) -> bool {
        self.option_flags.contains("luks")
    }

    /// True when the entry is LUKS-backed and keeps its key file under `keys_directory`.
    pub fn is_managed_by(&self, keys_directory: &Path) -> bool {
        self.is_luks()
            && self
                .key_file_path
                .as_deref()
                .is_some_and(|key| key.starts_with(keys_directory))
    }
}

/// Parse a `crypttab` document, silently skipping malformed lines.
pub fn parse_crypttab(contents: &str) -> Vec<ManagedVolumeEntry> {
    tokenize(contents)
        .iter()
        .filter_map(|tokens| ManagedVolumeEntry::from_tokens(tokens))
        .collect()
}

/// Read `crypttab` from disk; a missing file declares nothing.
pub fn read_crypttab(path: &Path) -> KeydriveResult<Vec<ManagedVolumeEntry>> {
    Ok(read_tab_file(path)?
        .iter()
        .filter_map(|tokens| ManagedVolumeEntry::from_tokens(tokens))
        .collect())
}

/// Return the entries keydrive manages for `keys_directory`, with source devices resolved.
pub fn find_managed_drives(
    paths: &HostPaths,
    keys_directory: &Path,
) -> KeydriveResult<Vec<ManagedVolumeEntry>> {
    let resolver = DeviceResolver::new(paths);
    Ok(read_crypttab(&paths.crypttab_path)?
        .into_iter()
        .filter(|entry| entry.is_managed_by(keys_directory))
        .map(|mut entry| {
            entry.resolved_source_device = resolver.resolve(&entry.source_locator);
            entry
        })
        .collect())
}
