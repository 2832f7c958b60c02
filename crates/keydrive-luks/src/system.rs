//! System-backed [`VolumeToolchain`] implementation.

use crate::command::ExternalCommand;
use keydrive_core::error::{KeydriveError, KeydriveResult};
use keydrive_core::{KeydriveConfig, ToolsCfg};
use keydrive_provider::VolumeToolchain;
use std::path::Path;

/// Shells out to `cryptsetup`, `cryptdisks_start`, `mkfs`, `mount`, `umount` and `blkid`.
#[derive(Debug, Clone, Default)]
pub struct SystemToolchain {
    tools: ToolsCfg,
}

impl SystemToolchain {
    pub fn new(tools: ToolsCfg) -> Self {
        Self { tools }
    }

    pub fn from_config(config: &KeydriveConfig) -> Self {
        Self::new(config.tools.clone())
    }

    pub fn tools(&self) -> &ToolsCfg {
        &self.tools
    }

    fn cryptsetup(&self, action: &str) -> ExternalCommand {
        ExternalCommand::new(&self.tools.cryptsetup).arg(action)
    }
}

impl VolumeToolchain for SystemToolchain {
    type Error = KeydriveError;

    fn format_container(&self, image: &Path) -> KeydriveResult<()> {
        self.cryptsetup("luksFormat").arg(image).run()?;
        Ok(())
    }

    fn open_container(&self, image: &Path, name: &str) -> KeydriveResult<()> {
        self.cryptsetup("luksOpen").arg(image).arg(name).run()?;
        Ok(())
    }

    fn close_container(&self, name: &str) -> KeydriveResult<()> {
        self.cryptsetup("luksClose").arg(name).run()?;
        Ok(())
    }

    fn add_key(&self, device: &Path, key_file: &Path) -> KeydriveResult<()> {
        self.cryptsetup("luksAddKey").arg(device).arg(key_file).run()?;
        Ok(())
    }

    fn start_mapping(&self, name: &str) -> KeydriveResult<()> {
        ExternalCommand::new(&self.tools.cryptdisks_start)
            .arg(name)
            .run()?;
        Ok(())
    }

    fn create_filesystem(&self, device: &Path) -> KeydriveResult<()> {
        ExternalCommand::new(&self.tools.mkfs).arg(device).run()?;
        Ok(())
    }

    fn mount(&self, device: &Path, target: Option<&Path>) -> KeydriveResult<()> {
        let mut command = ExternalCommand::new(&self.tools.mount).arg(device);
        if let Some(target) = target {
            command = command.arg(target);
        }
        command.run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> KeydriveResult<()> {
        ExternalCommand::new(&self.tools.umount).arg(target).run()?;
        Ok(())
    }

    fn block_device_type(&self, device: &Path) -> KeydriveResult<Option<String>> {
        let output = ExternalCommand::new(&self.tools.blkid)
            .args(["-o", "export"])
            .arg(device)
            .capture()
            .silent()
            .run()?;
        Ok(parse_export_type(&output.stdout))
    }
}

/// Pull `TYPE` out of `blkid -o export` output.
fn parse_export_type(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "TYPE")
            .then(|| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
