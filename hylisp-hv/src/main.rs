use anyhow::Context;
use clap::Parser;
use hylisp_hv::config::{Config, Overrides};
use hylisp_hv::control::{ControlPacketRouter, RawInjector, bind_control_socket};
use hylisp_hv::mapmsg::{MapEventMultiplexer, MapEventRouter, open_kernel_socket};
use hylisp_hv::notify::Notifier;
use hylisp_hv::register::{RegistrationService, SharedSockets};
use hylisp_hv::registry::ControlPlaneRegistry;
use hylisp_hv::tables::Tables;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hylisp-hv")]
#[command(about = "Multiplexing hypervisor for LISP control planes")]
struct Args {
    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the registration and reply endpoints
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// UDP port for LISP control packets
    #[arg(long)]
    control_port: Option<u16>,

    /// Control plane port that receives unassigned EIDs
    #[arg(long)]
    default_port: Option<u16>,
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hylisp-hv: {e:#}");
            std::process::exit(1);
        }
    };

    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(config) {
        error!("Failed to start hypervisor: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let base = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    Ok(base.with_overrides(Overrides {
        debug: args.debug,
        socket_dir: args.socket_dir.clone(),
        control_port: args.control_port,
        default_port: args.default_port,
    }))
}

fn run(config: Config) -> anyhow::Result<()> {
    info!(
        socket_dir = %config.socket_dir.display(),
        control_port = config.control_port,
        default_port = ?config.default_port,
        "Starting hylisp-hv"
    );

    let control = bind_control_socket(config.control_port)
        .with_context(|| format!("Failed to bind control port {}", config.control_port))?;
    let control = Arc::new(control);
    let shared = SharedSockets {
        ipv4: Arc::clone(&control),
        ipv6: None,
    };

    let tables = Arc::new(Tables::with_registry(ControlPlaneRegistry::with_default_port(
        config.default_port,
    )));
    let notifier = Arc::new(Notifier::new().context("Failed to create notifier")?);

    let registration = RegistrationService::bind(
        &config,
        Arc::clone(&tables),
        Arc::clone(&notifier),
        shared,
    )
    .context("Failed to set up registration endpoint")?;

    let kernel = Arc::new(open_kernel_socket().context("Failed to open mapping socket")?);

    let control_router = ControlPacketRouter::new(control, Arc::clone(&tables), RawInjector::new());
    let map_router = MapEventRouter::new(Arc::clone(&kernel), Arc::clone(&tables));
    let mut multiplexer = MapEventMultiplexer::new(notifier, tables, kernel);

    let handles = vec![
        thread::Builder::new()
            .name("registration".into())
            .spawn(move || {
                if let Err(e) = registration.run() {
                    error!(error = %e, "Registration service failed");
                    std::process::exit(1);
                }
            })
            .context("Failed to spawn registration thread")?,
        thread::Builder::new()
            .name("control-router".into())
            .spawn(move || control_router.run())
            .context("Failed to spawn control router thread")?,
        thread::Builder::new()
            .name("map-router".into())
            .spawn(move || map_router.run())
            .context("Failed to spawn map router thread")?,
        thread::Builder::new()
            .name("multiplexer".into())
            .spawn(move || {
                if let Err(e) = multiplexer.run() {
                    error!(error = %e, "Map multiplexer failed");
                    std::process::exit(1);
                }
            })
            .context("Failed to spawn multiplexer thread")?,
    ];

    info!("Hypervisor running");

    for handle in handles {
        if handle.join().is_err() {
            anyhow::bail!("Worker thread panicked");
        }
    }
    Ok(())
}
