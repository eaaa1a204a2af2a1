//! birdbridge binary entry point

use birdbridge::{AppState, config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics and AppState
/// 4. Recover the task queue and bootstrap allowed users
/// 5. Start workers, poller and HTTP server until ctrl-c
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("birdbridge={},tower_http=info", config.logging.level).into()
    });
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Starting birdbridge..."
    );

    // 3. Initialize metrics and application state
    birdbridge::metrics::init_metrics();
    let state = AppState::new(config.clone()).await?;

    // 4. Recover the task queue and bootstrap allowed users
    state.queue.recover_stale().await?;
    let purged = state.queue.purge_expired().await?;
    tracing::debug!(purged, "Expired tasks purged");
    state.bootstrap_users().await?;

    // 5. Start background loops and the HTTP server
    let shutdown = CancellationToken::new();
    let background = state.spawn_background(&shutdown);
    spawn_purge_task(state.clone(), shutdown.clone());

    let app = birdbridge::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
                _ = server_shutdown.cancelled() => {}
            }
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }

    tracing::info!("Stopped");
    Ok(())
}

/// Periodically drop finished tasks past their retention.
fn spawn_purge_task(state: AppState, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
        // Consume the immediate first tick, start-up already purged
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match state.queue.purge_expired().await {
                Ok(purged) => tracing::debug!(purged, "Expired tasks purged"),
                Err(e) => tracing::error!(error = %e, "Task purge failed"),
            }
        }
    });
}
