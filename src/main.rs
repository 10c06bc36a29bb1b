// ============================================================================
// Federated GraphQL Gateway
// ============================================================================
//
// Single entry point in front of the subgraph fleet. It handles:
// - Rate limiting (origin + credential keyed, Redis-backed)
// - JWT claims verification
// - Per-field policy authorization
// - Query depth/complexity limits
// - Sub-request fan-out with trust-header propagation
// - Partial-result merging
//
// Stateless apart from the shared Redis counter, so it scales horizontally.
//
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conflux_gateway::auth::ClaimsVerifier;
use conflux_gateway::config::Config;
use conflux_gateway::context::AppContext;
use conflux_gateway::dispatch::HttpSubgraphTransport;
use conflux_gateway::health;
use conflux_gateway::policy::default_policies;
use conflux_gateway::rate_limit::{RateLimiter, RedisCounterStore};
use conflux_gateway::registry::ServiceRegistry;
use conflux_gateway::routes::build_router;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== GraphQL Gateway Starting ===");
    info!("Port: {}", config.port);
    info!("Environment: {:?}", config.environment);
    info!("Subgraphs: {}", config.subgraphs.len());

    health::init_uptime();

    let store = Arc::new(
        RedisCounterStore::connect(&config.redis_url)
            .await
            .context("Failed to connect rate-limit counter store")?,
    );
    info!("Connected to Redis");

    let registry = Arc::new(ServiceRegistry::new(config.subgraphs.clone()));
    registry.rebuild().await;
    registry.clone().spawn_refresh(config.registry_refresh_secs);

    let ctx = AppContext::new(
        config.clone(),
        Arc::new(ClaimsVerifier::new(&config.auth)),
        Arc::new(default_policies()),
        Arc::new(RateLimiter::new(store, &config.rate_limit)),
        registry,
        Arc::new(HttpSubgraphTransport::new(config.dispatch_timeout_secs)),
    );

    let app = build_router(ctx);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("Failed to parse bind address")?;

    info!("Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Failed to start server")?;

    info!("Gateway shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
