use gatekeeper::{
    api::create_router,
    config::Config,
    observability::init_tracing,
    rate_limit::{spawn_sweeper, AdmissionControl, PolicyRegistry},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration; invalid policies must fail before serving traffic
    let config = Config::load()?;
    config.validate()?;

    // Initialize tracing/logging
    init_tracing(&config.observability);

    tracing::info!("Starting Gatekeeper service");
    tracing::info!("Configuration loaded: {:?}", config.server);

    // Build the admission-control unit, owned for the process lifetime
    let registry = PolicyRegistry::from_config(&config.rate_limit)?;
    let admission = Arc::new(AdmissionControl::new(
        registry,
        config.rate_limit.max_tracked_keys,
    ));

    // Background sweep of expired window entries
    let sweeper = spawn_sweeper(
        admission.store_handle(),
        Duration::from_secs(config.rate_limit.sweep_interval_seconds),
    );
    tracing::info!(
        "Window sweeper started (interval: {}s)",
        config.rate_limit.sweep_interval_seconds
    );

    // Create router
    let app = create_router(admission);

    // Bind server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Gatekeeper service is ready to accept requests");

    // Serve with connect info so the peer-address key fallback works
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
    })
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    // The sweeper is not needed for correctness; stop it with the process
    sweeper.abort();

    Ok(())
}
