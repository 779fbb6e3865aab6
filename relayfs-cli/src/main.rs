use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use relayfs_core::{LogLevel, RelayConfig, RelayFs};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relayfs")]
#[command(about = "Relay a mounted filesystem onto an existing directory")]
#[command(version)]
struct Cli {
    /// Mount options, comma separated (ro, allow_other, auto_unmount,
    /// default_permissions, fsname=NAME; anything else is passed through)
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG overrides it
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Existing directory to relay
    root: PathBuf,

    /// Where to mount the relay
    mountpoint: PathBuf,
}

impl Cli {
    /// Flags after `--` would otherwise be taken for paths.
    fn check_paths(&self) -> std::result::Result<(), String> {
        for path in [&self.root, &self.mountpoint] {
            if path.as_os_str().to_string_lossy().starts_with('-') {
                return Err(format!("expected a path, found option-like argument {}", path.display()));
            }
        }
        Ok(())
    }
}

/// Loads the configuration file, if any, and layers the command line on top.
fn build_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.mount.apply_all(cli.options.iter().map(String::as_str));

    if let Err(problems) = config.validate() {
        bail!("invalid configuration:\n  {}", problems.join("\n  "));
    }
    Ok(config)
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("relayfs={0},relayfs_core={0},relayfs_linux={0}", level).into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .with_context(|| format!("cannot resolve root {}", root.display()))?;
    if !root.is_dir() {
        bail!("root {} is not a directory", root.display());
    }
    Ok(root)
}

#[cfg(target_os = "linux")]
fn run(relay: RelayFs, mountpoint: &Path, config: &RelayConfig) -> Result<()> {
    relayfs_linux::mount(relay, mountpoint, &config.mount)
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))
}

#[cfg(not(target_os = "linux"))]
fn run(_relay: RelayFs, _mountpoint: &Path, _config: &RelayConfig) -> Result<()> {
    bail!("mounting is only supported on Linux");
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(msg) = cli.check_paths() {
        Cli::command().error(ErrorKind::InvalidValue, msg).exit();
    }

    let config = build_config(&cli)?;
    init_logging(config.log_level);

    // Creation modes are relayed as requested, not filtered by our umask.
    unsafe {
        libc::umask(0);
    }

    let root = canonical_root(&cli.root)?;
    info!("relaying {} at {}", root.display(), cli.mountpoint.display());
    let relay = RelayFs::from_config(root, &config);
    run(relay, &cli.mountpoint, &config)
}
