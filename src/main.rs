//! nestbox — entry point.
//!
//! Thin launch front end: pick an instance, run its application inside
//! the sandbox, relay the exit status. Instance provisioning and editing
//! are separate concerns; this binary only launches.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use miette::Result;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use nestbox::instance::InstanceStore;
use nestbox::sandbox::{find_primitive, Launcher, LauncherConfig};
use nestbox::service::ProfileRegistry;

/// Launch a desktop application inside its sandbox instance.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Instance to launch.
    instance: String,

    /// Application command line; defaults to the helper alone.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,

    /// Instance store base directory.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Containment primitive executable.
    #[arg(long)]
    primitive: Option<PathBuf>,

    /// In-sandbox helper binary.
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Seconds to wait for the helper handshake.
    #[arg(long, default_value = "5")]
    handshake_timeout: u64,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if find_primitive().is_none() && args.primitive.is_none() {
        warn!("bubblewrap not found on the usual paths; launch will fail without --primitive");
    }

    let registry = ProfileRegistry::load(&ProfileRegistry::default_search_path())
        .map_err(nestbox::Error::from)?;
    let store = InstanceStore::new(
        args.base_dir
            .unwrap_or_else(InstanceStore::default_base_dir),
    );

    let mut config = LauncherConfig {
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        ..LauncherConfig::default()
    };
    if let Some(primitive) = args.primitive {
        config.supervisor.primitive = primitive;
    }
    if let Some(helper) = args.helper {
        config.helper_path = helper;
    }

    let launcher = Launcher::new(registry, store, config);
    let mut sandbox = launcher.launch(&args.instance, &args.command)?;
    info!(
        instance = %sandbox.name(),
        pid = sandbox.pid(),
        "Sandbox running"
    );

    let exit = sandbox.wait()?;
    info!(%exit, "Sandbox finished");

    // Relay the application's outcome to our caller.
    std::process::exit(exit.code.unwrap_or(128 + exit.signal.unwrap_or(0)));
}
