//! # Dispatch Gateway - Main Entry Point
//!
//! Loads the configuration, installs logging and metrics, then serves until
//! SIGTERM or SIGINT. Shutdown stops accepting connections and drains
//! in-flight requests for at most `server.shutdown_timeout`.
//!
//! The configuration path comes from `GATEWAY_CONFIG_PATH`
//! (default `config/gateway.yaml`); `GATEWAY_*` variables override single
//! values, see `GatewayConfig::apply_env_overrides`.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dispatch_gateway::observability::{init_logging, metrics};
use dispatch_gateway::{AppState, GatewayConfig, GatewayResult, GatewayServer};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be up yet if configuration failed.
        eprintln!("dispatch-gateway failed: {}", e);
        error!("Gateway terminated with error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> GatewayResult<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());
    let config = GatewayConfig::load_from_file(&config_path).await?;

    init_logging(&config.observability.logging)?;
    info!("🚀 Starting dispatch gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("📋 Configuration loaded from {}", config_path);

    let metrics_handle = metrics::install_recorder(&config.observability.metrics)?;
    if metrics_handle.is_some() {
        info!(
            "📈 Prometheus metrics on {}",
            config.observability.metrics.endpoint_path
        );
    }

    let state = AppState::from_config(config, metrics_handle)?;
    info!(
        services = state.registry.routes().len(),
        rate_limit_backend = state.limiter.backend(),
        "🛣️  Service registry ready"
    );

    let server = GatewayServer::new(state)?;
    info!("🌐 Gateway ready on {}", server.bind_addr());

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server.run(shutdown).await?;
    info!("✅ Gateway shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("📡 Received SIGTERM, initiating graceful shutdown..."),
            _ = sigint.recv() => info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("📡 Received Ctrl+C, initiating graceful shutdown...");
    }

    shutdown.cancel();
}
