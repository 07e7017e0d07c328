use anyhow::Context;
use clap::{Parser, Subcommand};
use devmux::config::Config;
use devmux::install;
use devmux::proxy::BackendClient;
use devmux::reaper;
use devmux::registry::Registry;
use devmux::server::FrontDoor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Autostarts apps and serves them at subdomains, reloading them on change.
///
/// Per-app contract, relative to the serving directory:
///
///   APP/Procfile   "web: ./start.sh"  - launch command, receives $PORT
///   APP/.watch     "src/*"            - glob patterns that trigger reload
///
/// Visiting http://APP.localhost:7777 starts and serves the app. Folders
/// without a Procfile are served as static files.
#[derive(Debug, Parser)]
#[command(name = "devmux", version, verbatim_doc_comment)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to serve applications from
    #[arg(long = "dir")]
    root: Option<PathBuf>,

    /// Base host; apps are served on http://*.HOST
    #[arg(long = "host")]
    domain: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Install devmux as a boot-time service with the given flags baked in
    Install,
    /// Stop and remove the boot-time service
    Uninstall,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(domain) = cli.domain {
        config.domain = domain;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if cli.verbose {
        config.verbose = true;
    }
    config.resolve_root().context("invalid root directory")?;

    init_tracing(config.verbose);

    match cli.command {
        Some(Cmd::Install) => return install::install(&config),
        Some(Cmd::Uninstall) => return install::uninstall(),
        None => {}
    }

    serve(config).await
}

fn init_tracing(verbose: bool) {
    let directive = if verbose { "devmux=debug" } else { "devmux=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind, config.port))?;

    info!(
        root = %config.root.display(),
        domain = %config.domain,
        port = config.port,
        idle_ttl_secs = config.idle_ttl_secs,
        "starting devmux"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Registry::new(config);
    let client = Arc::new(BackendClient::new());

    tokio::spawn(reaper::run(Arc::clone(&registry), shutdown_rx.clone()));

    let front_door = FrontDoor::new(addr, Arc::clone(&registry), client, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = front_door.run().await {
            error!(error = %e, "front door error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    info!("stopping all apps");
    registry.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C, shutting down");
}
