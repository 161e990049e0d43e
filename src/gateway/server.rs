//! # HTTP Server Module
//!
//! The reverse proxy calls this server once per protected request. Every path and
//! method runs the forward-auth pipeline, except `GET /healthz` and `GET /metrics`.
//!
//! ## Key Features
//! - Correlation id assigned by the outermost layer, before any other stage
//! - Composition of policy store, provider registry, JWKS cache and validator
//! - Prometheus rendering on `/metrics` when a recorder is installed
//! - Graceful shutdown driven by a [`CancellationToken`]

use axum::{
    extract::{FromRef, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::authorization::RoleUserAuthorizer;
use crate::auth::azure::{AzureProviderLoader, AZURE_PROVIDER_TYPES};
use crate::auth::correlation::assign_correlation_id;
use crate::auth::jwks::{HttpJwksFetcher, JwksCache};
use crate::auth::middleware::{forward_auth, ForwardAuthPipeline};
use crate::auth::oidc::HttpDiscoveryClient;
use crate::auth::providers::ProviderRegistry;
use crate::auth::token::TokenValidator;
use crate::core::clock::Clock;
use crate::core::config::{GatewayConfig, ServerConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::policy::source::ConfigMapSource;
use crate::policy::store::ConfigMapPolicyStore;

/// Long-lived pieces built at startup
#[derive(Debug, Clone)]
pub struct Components {
    pub pipeline: Arc<ForwardAuthPipeline>,
    pub jwks: Arc<JwksCache>,
}

/// Wire the pipeline together from configuration and a record source
pub fn build_components(
    config: &GatewayConfig,
    source: Arc<dyn ConfigMapSource>,
    clock: Arc<dyn Clock>,
) -> GatewayResult<Components> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("forward-auth/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {}", e)))?;

    let fetcher = HttpJwksFetcher::new(http.clone(), config.jwks.fetch_timeout);
    let jwks = Arc::new(JwksCache::new(Arc::new(fetcher), clock.clone(), &config.jwks));

    let discovery = HttpDiscoveryClient::new(http, config.providers.discovery_timeout);
    let azure = AzureProviderLoader::new(config.providers.azure_authority.clone(), Arc::new(discovery));
    let providers = ProviderRegistry::new(source.clone()).with_loader(&AZURE_PROVIDER_TYPES, Arc::new(azure));

    let pipeline = ForwardAuthPipeline::new(
        Arc::new(ConfigMapPolicyStore::new(source)),
        Arc::new(providers),
        TokenValidator::new(jwks.clone(), clock, config.token.clone()),
        Arc::new(RoleUserAuthorizer),
    )
    .with_request_timeout(config.server.request_timeout)
    .with_forwarded_headers(config.server.trust_forwarded_headers);

    Ok(Components {
        pipeline: Arc::new(pipeline),
        jwks,
    })
}

/// Shared router state
#[derive(Clone, FromRef)]
pub struct AppState {
    pub pipeline: Arc<ForwardAuthPipeline>,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the router; exposed separately so tests can drive it in-process
pub fn router(pipeline: Arc<ForwardAuthPipeline>, metrics: Option<PrometheusHandle>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(health_check).fallback(forward_auth))
        .route("/metrics", get(metrics_handler).fallback(forward_auth))
        .fallback(forward_auth)
        .with_state(AppState { pipeline, metrics })
        .layer(TraceLayer::new_for_http())
        // Outermost: the correlation id exists before any other layer or stage runs
        .layer(middleware::from_fn(assign_correlation_id))
}

/// The forward-auth HTTP server
pub struct ForwardAuthServer {
    app: AxumRouter,
    bind_addr: SocketAddr,
}

impl ForwardAuthServer {
    pub fn new(
        pipeline: Arc<ForwardAuthPipeline>,
        metrics: Option<PrometheusHandle>,
        config: &ServerConfig,
    ) -> GatewayResult<Self> {
        let bind_addr = config
            .bind_address
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid bind_address {}: {}", config.bind_address, e)))?;
        Ok(Self {
            app: router(pipeline, metrics),
            bind_addr,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests
    pub async fn start(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| GatewayError::internal(format!("Failed to bind to {}: {}", self.bind_addr, e)))?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::internal(format!("Failed to read listener address: {}", e)))?;
        info!("Forward-auth server listening on {}", addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::internal(format!("Server error: {}", e)))?;

        info!("Forward-auth server stopped");
        Ok(())
    }
}

/// Health check handler
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn metrics_handler(State(metrics): State<Option<PrometheusHandle>>) -> Response {
    match metrics {
        Some(handle) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
