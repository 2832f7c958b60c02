use keydrive_core::error::KeydriveResult;
use keydrive_luks::systemd::{
    install_systemd_workaround, strip_requires_mounts_for, update_systemd_services,
};
use keydrive_luks::GeneratorPaths;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;
use tempfile::tempdir;

fn write_executable(path: &Path, contents: &str) -> KeydriveResult<()> {
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[test]
fn install_moves_the_original_once() -> KeydriveResult<()> {
    let tmp = tempdir()?;
    let paths = GeneratorPaths::at(tmp.path().join("systemd-cryptsetup-generator"));
    let program = tmp.path().join("keydrive");
    write_executable(&paths.generator, "#!/bin/sh\necho original\n")?;
    write_executable(&program, "#!/bin/sh\n")?;

    assert!(!paths.workaround_installed(&program));
    assert!(install_systemd_workaround(&paths, &program)?);
    assert!(paths.workaround_installed(&program));
    assert_eq!(fs::read_link(&paths.generator)?, program);
    assert_eq!(
        fs::read_to_string(&paths.wrapped)?,
        "#!/bin/sh\necho original\n"
    );

    assert!(!install_systemd_workaround(&paths, &program)?);
    assert_eq!(
        fs::read_to_string(&paths.wrapped)?,
        "#!/bin/sh\necho original\n"
    );
    Ok(())
}

#[test]
fn install_refreshes_the_original_after_an_upgrade() -> KeydriveResult<()> {
    let tmp = tempdir()?;
    let paths = GeneratorPaths::at(tmp.path().join("systemd-cryptsetup-generator"));
    let program = tmp.path().join("keydrive");
    write_executable(&paths.wrapped, "#!/bin/sh\necho old release\n")?;
    write_executable(&paths.generator, "#!/bin/sh\necho new release\n")?;
    write_executable(&program, "#!/bin/sh\n")?;

    assert!(install_systemd_workaround(&paths, &program)?);
    assert_eq!(fs::read_link(&paths.generator)?, program);
    assert_eq!(
        fs::read_to_string(&paths.wrapped)?,
        "#!/bin/sh\necho new release\n"
    );
    Ok(())
}

#[test]
fn install_replaces_a_foreign_symlink_and_keeps_the_original() -> KeydriveResult<()> {
    let tmp = tempdir()?;
    let paths = GeneratorPaths::at(tmp.path().join("systemd-cryptsetup-generator"));
    let program = tmp.path().join("keydrive");
    let stale = tmp.path().join("old-keydrive");
    write_executable(&paths.wrapped, "#!/bin/sh\necho original\n")?;
    write_executable(&program, "#!/bin/sh\n")?;
    symlink(&stale, &paths.generator)?;

    assert!(install_systemd_workaround(&paths, &program)?);
    assert_eq!(fs::read_link(&paths.generator)?, program);
    assert_eq!(
        fs::read_to_string(&paths.wrapped)?,
        "#!/bin/sh\necho original\n"
    );
    Ok(())
}

#[test]
fn generator_output_loses_mount_dependencies() -> KeydriveResult<()> {
    let tmp = tempdir()?;
    let out = tmp.path().join("generator");
    fs::create_dir_all(&out)?;
    let paths = GeneratorPaths::at(tmp.path().join("systemd-cryptsetup-generator"));
    write_executable(
        &paths.wrapped,
        r#"#!/bin/sh
cat > "$1/systemd-cryptsetup@data.service" <<UNIT
[Unit]
Description=Cryptography Setup for data
RequiresMountsFor=/mnt/keys/data.key
After=cryptsetup-pre.target

[Service]
Type=oneshot
UNIT
printf '[Unit]\nRequiresMountsFor=/srv\n' > "$1/other.service"
"#,
    )?;

    let rewritten = update_systemd_services(&paths, &[OsString::from(&out)], false)?;
    assert_eq!(rewritten, 1);
    assert_eq!(
        fs::read_to_string(out.join("systemd-cryptsetup@data.service"))?,
        "[Unit]\nDescription=Cryptography Setup for data\nAfter=cryptsetup-pre.target\n\n[Service]\nType=oneshot\n"
    );
    assert_eq!(
        fs::read_to_string(out.join("other.service"))?,
        "[Unit]\nRequiresMountsFor=/srv\n"
    );

    assert_eq!(strip_requires_mounts_for(&out)?, 0);
    Ok(())
}

#[test]
fn missing_output_directory_is_not_an_error() -> KeydriveResult<()> {
    let tmp = tempdir()?;
    assert_eq!(strip_requires_mounts_for(&tmp.path().join("absent"))?, 0);
    Ok(())
}
