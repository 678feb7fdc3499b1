//! OCFS2 Simple Provisioner
//!
//! Watches for claims annotated with this provisioner's name and backs them
//! with directories on a shared filesystem mounted at `--base-dir`.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ocfs2_simple_provisioner::{
    run_server, AllocatorConfig, ControllerConfig, Error, ProvisionController,
    ProvisionerMetrics, Result, ServerState, VolumeAllocator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// OCFS2 Simple Provisioner - directory-backed PersistentVolumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name claims and storage classes use to select this provisioner
    #[arg(long, env = "PROVISIONER_NAME", default_value = "ocfs2-simple-provisioner")]
    provisioner_name: String,

    /// Root of the shared filesystem holding all volumes
    #[arg(long, env = "BASE_DIR")]
    base_dir: PathBuf,

    /// Subdirectory of the base directory holding dynamic volumes
    #[arg(long, env = "DYN_DIR")]
    dyn_dir: PathBuf,

    /// Seconds between full resyncs
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value = "15")]
    resync_period_secs: u64,

    /// Attempts per claim or volume before giving up
    #[arg(long, env = "FAILED_RETRY_THRESHOLD", default_value = "5")]
    failed_retry_threshold: u32,

    /// Health and metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!(
        "Starting {} {}",
        ocfs2_simple_provisioner::NAME,
        ocfs2_simple_provisioner::VERSION
    );
    info!("  Provisioner: {}", args.provisioner_name);
    info!("  Base directory: {}", args.base_dir.display());
    info!("  Dynamic directory: {}", args.dyn_dir.display());

    let allocator_config = AllocatorConfig::new(&args.base_dir, &args.dyn_dir)?;
    let allocator = Arc::new(VolumeAllocator::new(allocator_config));

    let metrics_addr: SocketAddr = args.metrics_addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics address: {}", e))
    })?;
    let state = ServerState::new(ProvisionerMetrics::new()?);

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start health and metrics server
    let mut server_shutdown = shutdown_tx.subscribe();
    let server_state = state.clone();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown.recv().await;
        };
        if let Err(e) = run_server(metrics_addr, server_state, shutdown).await {
            error!("Health and metrics server error: {}", e);
        }
    });

    // Translate Ctrl-C into a shutdown broadcast
    let mut controller_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let controller_config = ControllerConfig {
        provisioner_name: args.provisioner_name.clone(),
        resync_period: Duration::from_secs(args.resync_period_secs),
        failed_retry_threshold: args.failed_retry_threshold,
    };
    let controller = ProvisionController::new(client, allocator, controller_config, state);

    controller
        .run(async move {
            let _ = controller_shutdown.recv().await;
        })
        .await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
