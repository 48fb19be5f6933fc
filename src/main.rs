#![deny(unsafe_code)]

// Use mimalloc for reduced allocation latency (enabled by default).
// Disable with `--no-default-features` if the allocator needs debugging.
#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod signal;

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use interposer_fuse::config::{CacheArg, Cli, Config};
use interposer_fuse::layers::{DynFs, FaultInjectingFs, MetricsFs, ThrottlingFs, TracingFs};
use interposer_fuse::passthrough::{PassthroughFs, PassthroughOptions};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if !cli.mountpoint.exists() {
        anyhow::bail!("mountpoint {} does not exist", cli.mountpoint.display());
    }
    if !cli.source.exists() {
        anyhow::bail!("source directory {} does not exist", cli.source.display());
    }

    let config = Config::load(cli.config.as_ref()).context("loading layer configuration")?;

    let fault_log_default = cli.mountpoint.join(".interposer-faults.log");
    let stack = build_stack(&cli, &config, &fault_log_default)?;

    let options = mount_options(&cli);
    tracing::info!(
        mountpoint = %cli.mountpoint.display(),
        source = %cli.source.display(),
        "mounting",
    );

    // spawn_mount2 hands the session a background thread; dropping it
    // unmounts (§5's shutdown contract: "stops the worker pool, unmounts,
    // destroys the session, and drives destroy").
    let session = fuser::spawn_mount2(DynFs(stack), &cli.mountpoint, &options).context("mounting filesystem")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let gate = signal::install_signal_handler(Arc::clone(&shutdown)).context("installing signal handler")?;
    signal::wait_for_shutdown(&gate);

    drop(session);
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "interposer_fuse=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Assembles the layer stack bottom-up: passthrough, then the
/// conditionally-enabled fault/throttle layers in the order they appear in
/// the config file, then the always-on metrics and tracing layers (§2's
/// composition order: "... then metrics, then tracing").
fn build_stack(
    cli: &Cli,
    config: &Config,
    fault_log_default: &std::path::Path,
) -> Result<Box<dyn fuser::Filesystem + Send + Sync>> {
    let options = PassthroughOptions {
        source: cli.source.clone(),
        attr_timeout: std::time::Duration::from_secs(cli.timeout),
        entry_timeout: std::time::Duration::from_secs(cli.timeout),
        cache: cli.cache.into(),
        writeback: cli.writeback_enabled(),
        flock: cli.flock_enabled(),
        xattr: cli.xattr_enabled(),
    };

    let passthrough = PassthroughFs::new(options).context("opening source directory")?;
    let mut stack: Box<dyn fuser::Filesystem + Send + Sync> = Box::new(passthrough);

    if config.faulty_io.enabled {
        let fault_config = config.fault_config(fault_log_default);
        stack = Box::new(FaultInjectingFs::new(stack, fault_config));
    }

    if config.throttle_io.enabled {
        stack = Box::new(ThrottlingFs::new(stack, config.throttle_config()));
    }

    if config.metrics.enabled {
        stack = Box::new(MetricsFs::new(stack));
    }

    if config.traces.enabled {
        stack = Box::new(TracingFs::new(stack));
    }

    Ok(stack)
}

fn mount_options(cli: &Cli) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("interposer".to_string()),
        MountOption::Subtype("interposer-fuse".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    if matches!(cli.cache, CacheArg::Never) {
        options.push(MountOption::CUSTOM("direct_io".to_string()));
    }
    // `fuser`'s session already dispatches from a single reader thread
    // (§5's scheduling note on worker-pool configurability); these three
    // are forwarded as raw mount options for the kernel side of that
    // negotiation rather than reimplemented in the session itself.
    if cli.clone_fd {
        options.push(MountOption::CUSTOM("clone_fd".to_string()));
    }
    if let Some(n) = cli.max_threads {
        options.push(MountOption::CUSTOM(format!("max_threads={n}")));
    }
    if cli.single_threaded {
        options.push(MountOption::CUSTOM("max_threads=1".to_string()));
    }
    options
}
