//! `keydrive`: unlock every managed encrypted drive with one pass phrase.

use anyhow::{bail, Context, Result};
use clap::Parser;
use keydrive_core::config::KeydriveConfig;
use keydrive_core::logging;
use keydrive_core::workflow::{initialize_keys_device, Environment, KeysDeviceOptions};
use keydrive_core::{CancelToken, KeydriveError, LogObserver};
use keydrive_luks::systemd::{install_systemd_workaround, update_systemd_services};
use keydrive_luks::{GeneratorPaths, SystemToolchain, SystemdQuirkProbe};
use log::{info, LevelFilter};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Uid;
use std::env;
use std::ffi::OsString;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::sync::OnceLock;

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

/// Command-line options.
#[derive(Parser, Debug)]
#[command(
    name = "keydrive",
    version,
    about = "Unlock all your encrypted drives with one pass phrase.",
    long_about = "Keeps key files for every LUKS drive declared in /etc/crypttab inside an \
                  encrypted keys image. Unlocking that image with one pass phrase unlocks \
                  and mounts all managed drives. Pass target names to limit which drives \
                  are activated."
)]
struct Cli {
    /// Path to the keydrive configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Location of the encrypted keys image.
    #[arg(short, long, value_name = "FILE")]
    image_file: Option<PathBuf>,

    /// Device-mapper name for the unlocked keys image.
    #[arg(short = 'n', long, value_name = "NAME")]
    mapper_name: Option<String>,

    /// Where to mount the keys image.
    #[arg(short, long, value_name = "DIR")]
    mount_point: Option<PathBuf>,

    /// Always unmount and lock the keys image afterwards.
    #[arg(long, conflicts_with = "no_cleanup")]
    cleanup: bool,

    /// Leave the keys image mounted and unlocked afterwards.
    #[arg(long)]
    no_cleanup: bool,

    /// Replace the systemd cryptsetup generator with a wrapper that drops key-file mount dependencies.
    #[arg(long)]
    install_systemd_workaround: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Increase logging verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Only activate these crypttab targets.
    #[arg(value_name = "TARGET")]
    volumes: Vec<String>,
}

impl Cli {
    fn cleanup_override(&self) -> Option<bool> {
        match (self.cleanup, self.no_cleanup) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    fn apply_overrides(&self, config: &mut KeydriveConfig) {
        let keys = &mut config.keys_device;
        if let Some(image_file) = &self.image_file {
            keys.image_file = image_file.clone();
        }
        if let Some(mapper_name) = &self.mapper_name {
            keys.mapper_name = mapper_name.clone();
        }
        if let Some(mount_point) = &self.mount_point {
            keys.mount_point = mount_point.clone();
        }
        if let Some(cleanup) = self.cleanup_override() {
            keys.cleanup = Some(cleanup);
        }
    }
}

fn main() {
    if let Err(err) = dispatch() {
        let cancelled = err
            .downcast_ref::<KeydriveError>()
            .is_some_and(KeydriveError::is_cancelled);
        if cancelled {
            eprintln!("Interrupted by operator, terminating");
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

fn dispatch() -> Result<()> {
    let generator = GeneratorPaths::default();
    let mut argv = env::args_os();
    let argv0 = argv.next().unwrap_or_default();
    if generator.workaround_requested(&argv0) {
        return run_generator(&generator, argv.collect());
    }
    run(Cli::parse())
}

/// Invoked by systemd in place of the cryptsetup generator.
fn run_generator(paths: &GeneratorPaths, args: Vec<OsString>) -> Result<()> {
    logging::init("info");
    let elevate = !Uid::effective().is_root();
    let rewritten = update_systemd_services(paths, &args, elevate)
        .context("failed to apply the systemd workaround")?;
    info!("rewrote {rewritten} cryptsetup unit(s)");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let level = logging::adjusted_level(LevelFilter::Info, cli.verbose, cli.quiet);
    logging::init(&level.to_string());

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| KeydriveConfig::default_path().to_path_buf());
    let mut config = KeydriveConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    cli.apply_overrides(&mut config);

    let issues = config.validate();
    if cli.check_config {
        if issues.is_empty() {
            println!("Configuration OK.");
            return Ok(());
        }
        for issue in &issues {
            println!("- {issue}");
        }
        bail!("configuration has {} issue(s)", issues.len());
    }
    if !issues.is_empty() {
        bail!("invalid configuration: {}", issues.join("; "));
    }

    if !Uid::effective().is_root() {
        return Err(KeydriveError::Privilege(
            "keydrive needs to run as root (try sudo)".into(),
        )
        .into());
    }

    if cli.install_systemd_workaround {
        let program = env::current_exe().context("unable to locate the keydrive executable")?;
        install_systemd_workaround(&GeneratorPaths::default(), &program)
            .context("failed to install the systemd workaround")?;
        return Ok(());
    }

    let cancel = install_interrupt_handlers()?;
    let toolchain = SystemToolchain::from_config(&config);
    let quirk = SystemdQuirkProbe::from_config(&config);
    let env = Environment {
        paths: &config.host,
        toolchain: &toolchain,
        quirk: &quirk,
        cancel: &cancel,
    };
    let mut options = KeysDeviceOptions::from_config(&config.keys_device);
    options.volumes = cli.volumes;

    initialize_keys_device(&env, &options, &mut LogObserver)?;
    Ok(())
}

extern "C" fn on_interrupt(_signal: c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

/// Route SIGINT and SIGTERM to a cancellation token.
fn install_interrupt_handlers() -> Result<CancelToken> {
    let token = CANCEL.get_or_init(CancelToken::new).clone();
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store on an initialized token.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("failed to install {signal} handler"))?;
    }
    Ok(token)
}
