#![forbid(unsafe_code)]
//! The `lcfs` mount binary.
//!
//! Mounts a device at two mount points backed by one shared filesystem:
//! the first for the host, the second propagated to the storage-driver
//! plugin. Exits non-zero when the mount fails.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lcfs_block::{BlockDevice, FileBlockDevice};
use lcfs_core::Gfs;
use lcfs_fuse::MountOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Interval between background flusher passes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(
    name = "lcfs",
    about = "LCFS — layered copy-on-write filesystem for container images"
)]
struct Cli {
    /// Backing device or image file.
    device: PathBuf,
    /// Mount point on the host.
    mnt: PathBuf,
    /// Mount point propagated to the storage-driver plugin.
    mnt2: PathBuf,
    /// Stay in the foreground.
    #[arg(short = 'f')]
    foreground: bool,
    /// Display debugging info.
    #[arg(short = 'd')]
    debug: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Without -f the process still serves in-process (no fork), but runs
    // quiet like a daemon would.
    let default_level = if cli.debug {
        "debug"
    } else if cli.foreground {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if cli.mnt == cli.mnt2 {
        bail!("specify two different mount points");
    }
    for mnt in [&cli.mnt, &cli.mnt2] {
        if !mnt.is_dir() {
            bail!("mount point {} is not a directory", mnt.display());
        }
    }

    let dev = FileBlockDevice::open(&cli.device)
        .with_context(|| format!("opening device {}", cli.device.display()))?;
    let gfs = Gfs::mount(Arc::new(dev) as Arc<dyn BlockDevice>)
        .with_context(|| format!("mounting {}", cli.device.display()))?;
    gfs.start_flusher(FLUSH_INTERVAL);

    let options = MountOptions::default();
    let session = lcfs_fuse::mount_background(Arc::clone(&gfs), &cli.mnt, &options)
        .with_context(|| format!("serving {}", cli.mnt.display()))?;
    info!(device = %cli.device.display(), mnt = %cli.mnt.display(), "mounted");

    // The second mount blocks this thread until it is unmounted; both
    // sessions share the same filesystem state.
    let result = lcfs_fuse::mount(Arc::clone(&gfs), &cli.mnt2, &options)
        .with_context(|| format!("serving {}", cli.mnt2.display()));
    drop(session);
    gfs.unmount().context("unmounting")?;
    info!(device = %cli.device.display(), "unmounted");
    result
}
