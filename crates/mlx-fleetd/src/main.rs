//! mlx-fleetd — MLX fleet controller daemon.
//!
//! Runs the supervisor and dispatcher in one process: spawns and
//! health-monitors the worker fleet, reverse-proxies completion traffic
//! across it, and exposes status, metrics, and lifecycle control over HTTP.

mod logging;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mlx_fleet::FleetConfig;
use state::AppState;

#[derive(Parser, Debug)]
#[command(
    name = "mlx-fleetd",
    version,
    about = "MLX fleet controller: worker supervisor + load-balancing dispatcher"
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "mlx_fleet_config.json")]
    config: PathBuf,

    /// Controller HTTP bind port (overrides the configured port).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // ---- 1. Initialise logging ----
    let _log_guard = logging::init()?;

    // ---- 2. Load configuration (falls back to defaults on failure) ----
    let config = Arc::new(FleetConfig::load(&args.config));
    let port = args.port.unwrap_or(config.mlx_servers.load_balancer_port);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instances = config.mlx_servers.instances,
        base_port = config.mlx_servers.base_port,
        "mlx-fleetd starting"
    );

    // ---- 3. Build shared state ----
    let cancel = CancellationToken::new();
    let state = AppState::new(config.clone(), cancel.clone());

    // ---- 4. Bind the controller port before anything else ----
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind controller port {}", addr))?;
    info!(addr, "controller listening");

    // ---- 5. Start the fleet in the background ----
    // The HTTP surface must be reachable while workers load their models.
    let startup_supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        startup_supervisor.start_all().await;
    });

    // ---- 6. Background loops ----
    let prober = state.prober.clone();
    let prober_cancel = cancel.clone();
    tokio::spawn(async move {
        prober.run(prober_cancel).await;
    });

    let monitor_supervisor = state.supervisor.clone();
    let monitor_cancel = cancel.clone();
    tokio::spawn(async move {
        monitor_supervisor.run_performance_monitor(monitor_cancel).await;
    });

    let tuner = state.tuner.clone();
    let tuner_cancel = cancel.clone();
    tokio::spawn(async move {
        tuner.run(tuner_cancel).await;
    });

    // ---- 7. Serve until an OS shutdown signal arrives ----
    let app = routes::configure(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(signal_shutdown())
        .await
        .context("controller HTTP server failed")?;

    // ---- 8. Graceful shutdown: cancel loops, stop the fleet ----
    info!("initiating graceful shutdown");
    cancel.cancel();
    state.supervisor.stop_all().await;

    info!("mlx-fleetd exited cleanly");
    Ok(())
}

/// Wait for an OS shutdown signal.
async fn signal_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to register Ctrl+C handler");
    }
}
