use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use toolgate::config::Config;
use toolgate::health::HealthReporter;
use toolgate::multiplexer::Multiplexer;
use toolgate::server::{GatewayServer, PKG_NAME, VERSION};
use toolgate::supervisor::Supervisor;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "toolgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("toolgate=info".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if explicit_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    config.apply_env_overrides().map_err(|e| {
        error!(error = %e, "Invalid environment override");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let mux = Multiplexer::new(&config);
    let supervisor = Supervisor::new(config.worker.clone(), Arc::clone(&mux));
    let health = HealthReporter::new(
        Arc::clone(&supervisor),
        Arc::clone(&mux),
        config.health.inactivity_timeout(),
    );

    // Bind before starting the worker so a taken port fails fast
    let server = GatewayServer::bind(bind_addr, Arc::clone(&mux), health, shutdown_rx.clone()).await?;

    supervisor.start();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let shutdown = async {
        info!("Stopping worker...");
        supervisor.stop().await;
        let _ = server_handle.await;
    };

    if tokio::time::timeout(config.server.shutdown_timeout(), shutdown)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Shutdown timed out"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tool gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        server_name = %config.server.name,
        "Server configuration"
    );
    info!(
        command = %config.worker.command,
        args = ?config.worker.args,
        working_dir = ?config.worker.working_dir,
        "Worker command"
    );
    info!(
        max_restarts = config.worker.max_restarts,
        restart_backoff_ms = config.worker.restart_backoff_ms,
        stable_runtime_ms = config.worker.stable_runtime_ms,
        request_timeout_ms = ?config.worker.request_timeout_ms,
        "Supervision settings"
    );
    info!(
        max_depth = ?config.queue.max_depth,
        inactivity_timeout_ms = config.health.inactivity_timeout_ms,
        create_methods = ?config.resources.create_methods,
        dispose_method = %config.resources.dispose_method,
        "Queue, health and resource settings"
    );
}
