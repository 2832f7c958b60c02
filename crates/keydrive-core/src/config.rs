//! Configuration model for keydrive.
//!
//! Everything is optional: a host without `/etc/keydrive.toml` runs on the
//! built-in defaults, and command-line flags override whatever the file says.

use crate::error::{KeydriveError, KeydriveResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keydrive.toml";
pub const DEFAULT_IMAGE_FILE: &str = "/root/encryption-keys.img";
pub const DEFAULT_MAPPER_NAME: &str = "encryption-keys";
pub const DEFAULT_MOUNT_POINT: &str = "/mnt/keys";

/// Where the keys volume lives and how it is exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysDeviceCfg {
    #[serde(default = "default_image_file")]
    pub image_file: PathBuf,

    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,

    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// Unmount and lock the keys volume after the run; absent means "ask the host".
    #[serde(default)]
    pub cleanup: Option<bool>,
}

fn default_image_file() -> PathBuf {
    PathBuf::from(DEFAULT_IMAGE_FILE)
}

fn default_mapper_name() -> String {
    DEFAULT_MAPPER_NAME.to_string()
}

fn default_mount_point() -> PathBuf {
    PathBuf::from(DEFAULT_MOUNT_POINT)
}

impl Default for KeysDeviceCfg {
    fn default() -> Self {
        Self {
            image_file: default_image_file(),
            mapper_name: default_mapper_name(),
            mount_point: default_mount_point(),
            cleanup: None,
        }
    }
}

/// Host locations consulted by the parsers and inspectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPaths {
    #[serde(default = "default_crypttab_path")]
    pub crypttab_path: PathBuf,

    #[serde(default = "default_mtab_path")]
    pub mtab_path: PathBuf,

    #[serde(default = "default_mapper_dir")]
    pub mapper_dir: PathBuf,

    #[serde(default = "default_disk_by_uuid_dir")]
    pub disk_by_uuid_dir: PathBuf,

    #[serde(default = "default_disk_by_label_dir")]
    pub disk_by_label_dir: PathBuf,

    #[serde(default = "default_disk_by_partuuid_dir")]
    pub disk_by_partuuid_dir: PathBuf,
}

fn default_crypttab_path() -> PathBuf {
    PathBuf::from("/etc/crypttab")
}

fn default_mtab_path() -> PathBuf {
    PathBuf::from("/etc/mtab")
}

fn default_mapper_dir() -> PathBuf {
    PathBuf::from("/dev/mapper")
}

fn default_disk_by_uuid_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-uuid")
}

fn default_disk_by_label_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-label")
}

fn default_disk_by_partuuid_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-partuuid")
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            crypttab_path: default_crypttab_path(),
            mtab_path: default_mtab_path(),
            mapper_dir: default_mapper_dir(),
            disk_by_uuid_dir: default_disk_by_uuid_dir(),
            disk_by_label_dir: default_disk_by_label_dir(),
            disk_by_partuuid_dir: default_disk_by_partuuid_dir(),
        }
    }
}

impl HostPaths {
    /// Device-mapper node for `name`.
    pub fn mapper_device(&self, name: &str) -> PathBuf {
        self.mapper_dir.join(name)
    }

    /// Whether a mapping called `name` is currently present.
    pub fn mapping_exists(&self, name: &str) -> bool {
        self.mapper_device(name).exists()
    }
}

/// Programs invoked for toolchain operations; bare names are looked up on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsCfg {
    #[serde(default = "default_cryptsetup")]
    pub cryptsetup: String,

    #[serde(default = "default_cryptdisks_start")]
    pub cryptdisks_start: String,

    #[serde(default = "default_mkfs")]
    pub mkfs: String,

    #[serde(default = "default_mount")]
    pub mount: String,

    #[serde(default = "default_umount")]
    pub umount: String,

    #[serde(default = "default_blkid")]
    pub blkid: String,

    #[serde(default = "default_systemctl")]
    pub systemctl: String,
}

fn default_cryptsetup() -> String {
    "cryptsetup".to_string()
}

fn default_cryptdisks_start() -> String {
    "cryptdisks_start".to_string()
}

fn default_mkfs() -> String {
    "mkfs.ext4".to_string()
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

fn default_blkid() -> String {
    "blkid".to_string()
}

fn default_systemctl() -> String {
    "systemctl".to_string()
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self {
            cryptsetup: default_cryptsetup(),
            cryptdisks_start: default_cryptdisks_start(),
            mkfs: default_mkfs(),
            mount: default_mount(),
            umount: default_umount(),
            blkid: default_blkid(),
            systemctl: default_systemctl(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeydriveConfig {
    #[serde(default)]
    pub keys_device: KeysDeviceCfg,

    #[serde(default)]
    pub host: HostPaths,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl KeydriveConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Parse a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> KeydriveResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = Self::from_toml(&contents)?;
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Load `path` if it exists; fall back to defaults only for the system-wide path.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> KeydriveResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        if path == Self::default_path() {
            debug!(
                "no configuration at {}; using built-in defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        Err(KeydriveError::InvalidConfig(format!(
            "configuration file {} does not exist",
            path.display()
        )))
    }

    pub fn from_toml(contents: &str) -> KeydriveResult<Self> {
        Ok(toml::from_str::<Self>(contents)?)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let keys = &self.keys_device;

        if !keys.image_file.is_absolute() {
            issues.push(format!(
                "keys_device.image_file must be an absolute path (got {})",
                keys.image_file.display()
            ));
        }
        if !keys.mount_point.is_absolute() {
            issues.push(format!(
                "keys_device.mount_point must be an absolute path (got {})",
                keys.mount_point.display()
            ));
        } else if keys.mount_point == Path::new("/") {
            issues.push("keys_device.mount_point cannot be the root directory".to_string());
        }

        let name = keys.mapper_name.trim();
        if name.is_empty() {
            issues.push("keys_device.mapper_name cannot be empty".to_string());
        } else if name.contains('/') || name != keys.mapper_name {
            issues.push(format!(
                "keys_device.mapper_name contains invalid characters: {:?}",
                keys.mapper_name
            ));
        }

        for (label, program) in [
            ("cryptsetup", &self.tools.cryptsetup),
            ("cryptdisks_start", &self.tools.cryptdisks_start),
            ("mkfs", &self.tools.mkfs),
            ("mount", &self.tools.mount),
            ("umount", &self.tools.umount),
            ("blkid", &self.tools.blkid),
            ("systemctl", &self.tools.systemctl),
        ] {
            if program.trim().is_empty() {
                issues.push(format!("tools.{label} cannot be empty"));
            }
        }

        issues
    }
}
