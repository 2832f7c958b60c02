//! Drives the real command runner and orchestrator against fake host programs.

use keydrive_core::error::{KeydriveError, KeydriveResult};
use keydrive_core::workflow::{
    initialize_keys_device, Environment, KeysDeviceOptions, WorkflowEvent,
};
use keydrive_core::{CancelToken, HostPaths, ToolsCfg};
use keydrive_luks::{SystemToolchain, SystemdQuirkProbe};
use keydrive_provider::{InitQuirkProbe, NoQuirk, VolumeToolchain};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn write_executable(path: &Path, contents: &str) -> KeydriveResult<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Scratch host with shell-script stand-ins for every program keydrive runs.
struct FakeHost {
    tmp: TempDir,
    paths: HostPaths,
    tools: ToolsCfg,
    log: PathBuf,
}

impl FakeHost {
    fn new() -> KeydriveResult<Self> {
        let tmp = tempdir()?;
        let root = tmp.path();
        let bin = root.join("bin");
        let log = root.join("commands.log");
        let paths = HostPaths {
            crypttab_path: root.join("crypttab"),
            mtab_path: root.join("mtab"),
            mapper_dir: root.join("mapper"),
            disk_by_uuid_dir: root.join("by-uuid"),
            disk_by_label_dir: root.join("by-label"),
            disk_by_partuuid_dir: root.join("by-partuuid"),
        };
        for dir in [&bin, &paths.mapper_dir, &paths.disk_by_uuid_dir] {
            fs::create_dir_all(dir)?;
        }
        fs::write(&paths.mtab_path, "")?;

        let mapper = paths.mapper_dir.display().to_string();
        let mtab = paths.mtab_path.display().to_string();
        let log_path = log.display().to_string();
        let root_dir = root.display().to_string();
        let key_dir = root.join("keys").display().to_string();

        let cryptsetup = bin.join("cryptsetup");
        write_executable(
            &cryptsetup,
            &format!(
                r#"#!/bin/sh
LOG="{log_path}"
MAPPER="{mapper}"
echo "cryptsetup $*" >> "$LOG"
if [ -f "{root_dir}/fail-$1" ]; then
  echo "Device busy." 1>&2
  exit 5
fi
case "$1" in
  luksFormat) exit 0 ;;
  luksOpen) touch "$MAPPER/$3"; exit 0 ;;
  luksClose) rm -f "$MAPPER/$2"; exit 0 ;;
  luksAddKey) exit 0 ;;
esac
echo "unsupported $*" 1>&2
exit 1
"#
            ),
        )?;

        let cryptdisks_start = bin.join("cryptdisks_start");
        write_executable(
            &cryptdisks_start,
            &format!(
                r#"#!/bin/sh
echo "cryptdisks_start $*" >> "{log_path}"
touch "{mapper}/$1"
"#
            ),
        )?;

        let mkfs = bin.join("mkfs.ext4");
        write_executable(
            &mkfs,
            &format!("#!/bin/sh\necho \"mkfs.ext4 $*\" >> \"{log_path}\"\n"),
        )?;

        let mount = bin.join("mount");
        write_executable(
            &mount,
            &format!(
                r#"#!/bin/sh
echo "mount $*" >> "{log_path}"
if [ $# -eq 2 ]; then
  echo "$1 $2 ext4 rw 0 0" >> "{mtab}"
else
  echo "$1 /media/$(basename "$1") ext4 rw 0 0" >> "{mtab}"
fi
"#
            ),
        )?;

        let umount = bin.join("umount");
        write_executable(
            &umount,
            &format!(
                r#"#!/bin/sh
echo "umount $*" >> "{log_path}"
awk -v target="$1" '$2 != target' "{mtab}" > "{mtab}.tmp"
mv "{mtab}.tmp" "{mtab}"
"#
            ),
        )?;

        let blkid = bin.join("blkid");
        write_executable(
            &blkid,
            &format!(
                r#"#!/bin/sh
echo "blkid $*" >> "{log_path}"
case "$3" in
  */pv) printf 'DEVNAME=%s\nTYPE=LVM2_member\n' "$3" ;;
  *) printf 'DEVNAME=%s\nTYPE=ext4\n' "$3" ;;
esac
"#
            ),
        )?;

        let systemctl = bin.join("systemctl");
        write_executable(
            &systemctl,
            &format!(
                r#"#!/bin/sh
echo "systemctl $*" >> "{log_path}"
case "$2" in
  systemd-cryptsetup@data.service) printf 'Id=%s\nRequiresMountsFor=%s\n' "$2" "{key_dir}/data.key" ;;
  *) printf 'Id=%s\n' "$2" ;;
esac
"#
            ),
        )?;

        let tools = ToolsCfg {
            cryptsetup: cryptsetup.display().to_string(),
            cryptdisks_start: cryptdisks_start.display().to_string(),
            mkfs: mkfs.display().to_string(),
            mount: mount.display().to_string(),
            umount: umount.display().to_string(),
            blkid: blkid.display().to_string(),
            systemctl: systemctl.display().to_string(),
        };

        Ok(Self {
            tmp,
            paths,
            tools,
            log,
        })
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn options(&self) -> KeysDeviceOptions {
        KeysDeviceOptions {
            image_file: self.root().join("keys.img"),
            mapper_name: "encryption-keys".into(),
            mount_point: self.root().join("keys"),
            volumes: Vec::new(),
            cleanup: None,
        }
    }

    fn attach(&self, uuid: &str) -> KeydriveResult<PathBuf> {
        let device = self.root().join(format!("disk-{uuid}"));
        fs::write(&device, b"")?;
        symlink(&device, self.paths.disk_by_uuid_dir.join(uuid))?;
        Ok(fs::canonicalize(&device)?)
    }

    fn declare(&self, lines: &[(&str, &str)]) -> KeydriveResult<()> {
        let keys = self.options().mount_point;
        let contents: String = lines
            .iter()
            .map(|(target, uuid)| {
                format!(
                    "{target} UUID={uuid} {}/{target}.key luks\n",
                    keys.display()
                )
            })
            .collect();
        fs::write(&self.paths.crypttab_path, contents)?;
        Ok(())
    }

    fn commands(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn run(
        &self,
        quirk: &dyn InitQuirkProbe,
    ) -> KeydriveResult<keydrive_core::KeysDeviceSummary> {
        let toolchain = SystemToolchain::new(self.tools.clone());
        let cancel = CancelToken::new();
        let env = Environment {
            paths: &self.paths,
            toolchain: &toolchain,
            quirk,
            cancel: &cancel,
        };
        initialize_keys_device(&env, &self.options(), &mut Vec::<WorkflowEvent>::new())
    }
}

#[test]
fn provisioning_runs_the_expected_programs() -> KeydriveResult<()> {
    let host = FakeHost::new()?;
    let data = host.attach("1111")?;
    host.declare(&[("data", "1111"), ("archive", "9999")])?;

    let summary = host.run(&NoQuirk)?;
    assert_eq!((summary.configured, summary.available, summary.unlocked), (2, 1, 1));

    let options = host.options();
    let keys_mapper = host.paths.mapper_device("encryption-keys");
    let data_mapper = host.paths.mapper_device("data");
    assert_eq!(
        host.commands(),
        vec![
            format!("cryptsetup luksFormat {}", options.image_file.display()),
            format!(
                "cryptsetup luksOpen {} encryption-keys",
                options.image_file.display()
            ),
            format!("mkfs.ext4 {}", keys_mapper.display()),
            format!(
                "mount {} {}",
                keys_mapper.display(),
                options.mount_point.display()
            ),
            format!(
                "cryptsetup luksAddKey {} {}",
                data.display(),
                options.mount_point.join("data.key").display()
            ),
            "cryptdisks_start data".to_string(),
            format!("blkid -o export {}", data_mapper.display()),
            format!("mount {}", data_mapper.display()),
            format!("umount {}", options.mount_point.display()),
            "cryptsetup luksClose encryption-keys".to_string(),
        ]
    );

    let mtab = fs::read_to_string(&host.paths.mtab_path)?;
    assert!(mtab.contains(&data_mapper.display().to_string()));
    assert!(!mtab.contains(&keys_mapper.display().to_string()));
    Ok(())
}

#[test]
fn failing_format_removes_the_image() -> KeydriveResult<()> {
    let host = FakeHost::new()?;
    host.declare(&[])?;
    fs::write(host.root().join("fail-luksFormat"), "")?;
    let result = host.run(&NoQuirk);

    match result {
        Err(KeydriveError::CommandFailed { command, status }) => {
            assert!(command.ends_with(&format!(
                "luksFormat {}",
                host.options().image_file.display()
            )));
            assert!(status.contains("exit status: 5"), "{status}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!host.options().image_file.exists());
    Ok(())
}

#[test]
fn lvm_members_are_detected_through_blkid() -> KeydriveResult<()> {
    let host = FakeHost::new()?;
    let toolchain = SystemToolchain::new(host.tools.clone());
    assert_eq!(
        toolchain.block_device_type(&host.paths.mapper_device("pv"))?,
        Some("LVM2_member".to_string())
    );
    assert_eq!(
        toolchain.block_device_type(&host.paths.mapper_device("data"))?,
        Some("ext4".to_string())
    );
    Ok(())
}

#[test]
fn missing_programs_surface_as_spawn_errors() {
    let toolchain = SystemToolchain::new(ToolsCfg {
        cryptsetup: "/nonexistent/cryptsetup".into(),
        ..ToolsCfg::default()
    });
    let err = toolchain.close_container("encryption-keys").unwrap_err();
    assert!(matches!(err, KeydriveError::CommandSpawn { .. }));
}

#[test]
fn systemd_probe_spots_mount_dependencies() -> KeydriveResult<()> {
    let host = FakeHost::new()?;
    host.declare(&[("data", "1111"), ("backup", "2222")])?;
    let keys = host.options().mount_point;

    let probe = SystemdQuirkProbe::new(host.tools.systemctl.clone(), host.paths.clone());
    let cascades = probe.unmount_cascades(&keys);
    let elsewhere = probe.unmount_cascades(&host.root().join("elsewhere"));

    assert!(cascades);
    assert!(!elsewhere);
    assert!(host
        .commands()
        .contains(&"systemctl show systemd-cryptsetup@data.service".to_string()));
    Ok(())
}

#[test]
fn systemd_probe_without_systemctl_reports_no_quirk() -> KeydriveResult<()> {
    let host = FakeHost::new()?;
    host.declare(&[("data", "1111")])?;
    let probe = SystemdQuirkProbe::new("/nonexistent/systemctl", host.paths.clone());
    assert!(!probe.unmount_cascades(&host.options().mount_point));
    Ok(())
}
