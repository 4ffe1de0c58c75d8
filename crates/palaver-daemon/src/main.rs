//! Binary entry point: argument parsing, logging, store wiring, and
//! signal handling.
//!
//! The daemon proper lives in the library crate; this file only assembles
//! it. The process exits non-zero exclusively on startup failures
//! (configuration, bind, TLS material); anything after startup is handled
//! inside the supervisor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use palaver_core::auth::MemoryAuthStore;
use palaver_core::clock::SystemClock;
use palaver_core::config::Config;
use palaver_daemon::{Server, ServerDeps};

/// palaver - secure real-time chat daemon
#[derive(Parser, Debug)]
#[command(name = "palaver-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "palaver.toml")]
    config: PathBuf,

    /// Override the listen address
    #[arg(long)]
    bind_address: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seed a development user as NAME:PASSWORD (repeatable).
    ///
    /// The built-in store is in-memory and development-only; production
    /// deployments provide a real credential store.
    #[arg(long = "dev-user", value_name = "NAME:PASSWORD")]
    dev_users: Vec<String>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    // Install the rustls crypto provider before any TLS configuration is
    // built; rustls panics without a default provider.
    rustls::crypto::ring::default_provider().install_default().ok();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "no config file found, using defaults");
        Config::default()
    };

    if let Some(addr) = args.bind_address {
        config.server.bind_address = addr;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.no_metrics {
        config.monitoring.enable_metrics = false;
    }

    let auth_store = build_dev_store(&args.dev_users)?;

    let deps = ServerDeps {
        auth_store,
        history: None,
        clock: Arc::new(SystemClock),
    };

    let server = Server::bind(config, deps).context("failed to start server")?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal received");
        shutdown.cancel();
    });

    server.run().await;
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Builds the development credential store from `--dev-user` flags.
fn build_dev_store(specs: &[String]) -> Result<Arc<MemoryAuthStore>> {
    let mut store = MemoryAuthStore::new(3600);
    for (index, spec) in specs.iter().enumerate() {
        let (name, password) = spec
            .split_once(':')
            .with_context(|| format!("--dev-user {spec:?} is not NAME:PASSWORD"))?;
        let user_id = index as u64 + 1;
        store = store.with_user(user_id, name, password);
        info!(user = name, user_id, "seeded development user");
    }
    if specs.is_empty() {
        warn!("no users seeded; every login will fail until --dev-user is provided");
    }
    Ok(Arc::new(store))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        },
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGINT handler");
            std::future::pending::<()>().await;
            return;
        },
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to wait for ctrl-c");
        std::future::pending::<()>().await;
    }
}
