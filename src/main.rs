//! # Forward-Auth Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. Load configuration (`FORWARD_AUTH_CONFIG` file, then environment overrides)
//! 2. Initialize logging and the Prometheus recorder
//! 3. Connect the policy record source (Kubernetes or a static file)
//! 4. Build the pipeline and, when configured, start the background JWKS refresher
//! 5. Serve until SIGINT/SIGTERM, then drain in-flight requests

use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use forward_auth::core::clock::SystemClock;
use forward_auth::core::config::PolicySourceKind;
use forward_auth::observability::{init_logging, install_recorder};
use forward_auth::policy::source::{ConfigMapSource, KubeConfigMapSource, StaticConfigMapSource};
use forward_auth::{build_components, ForwardAuthServer, GatewayConfig, GatewayError, GatewayResult};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config = GatewayConfig::load().await?;
    init_logging(&config.logging)?;

    info!("🚀 Starting forward-auth gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!(error = %e, "Forward-auth gateway failed");
        return Err(e);
    }

    info!("✅ Forward-auth gateway shutdown complete");
    Ok(())
}

async fn run(config: GatewayConfig) -> GatewayResult<()> {
    let metrics = install_recorder()?;

    info!("📋 Connecting policy source: {:?}", config.policy.source);
    let source = connect_policy_source(&config).await?;

    let components = build_components(&config, source, Arc::new(SystemClock))?;
    let shutdown = CancellationToken::new();

    let refresher = config.jwks.background_refresh_interval.map(|interval| {
        info!("🔄 Background JWKS refresh every {:?}", interval);
        components.jwks.spawn_refresher(interval, shutdown.clone())
    });

    let server = ForwardAuthServer::new(components.pipeline, Some(metrics), &config.server)?;
    info!("🌐 Forward-auth ready on {}", server.bind_addr());

    tokio::spawn(wait_for_signal(shutdown.clone()));
    server.start(shutdown.clone()).await?;

    // The server can also stop on its own; make sure the refresher follows it.
    shutdown.cancel();
    if let Some(refresher) = refresher {
        if let Err(e) = refresher.await {
            error!(error = %e, "JWKS refresher task failed");
        }
    }
    Ok(())
}

async fn connect_policy_source(config: &GatewayConfig) -> GatewayResult<Arc<dyn ConfigMapSource>> {
    match config.policy.source {
        PolicySourceKind::Kubernetes => Ok(Arc::new(KubeConfigMapSource::connect(&config.policy).await?)),
        PolicySourceKind::Static => {
            let path = config
                .policy
                .static_file
                .as_ref()
                .ok_or_else(|| GatewayError::config("policy static_file is required when source is static"))?;
            Ok(Arc::new(StaticConfigMapSource::load_from_file(path).await?))
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT, initiating graceful shutdown..."),
        _ = terminate => info!("📡 Received SIGTERM, initiating graceful shutdown..."),
        _ = shutdown.cancelled() => return,
    }

    info!("⏳ Waiting for in-flight requests to complete...");
    shutdown.cancel();
}
