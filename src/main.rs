use dotenv::dotenv;
use reserve_api::cache::StockCache;
use reserve_api::config;
use reserve_api::db;
use reserve_api::events::outbox::{OutboxPublisher, PublisherConfig};
use reserve_api::health;
use reserve_api::message_queue::{InMemoryMessageQueue, MessageQueue};
use reserve_api::services::{ExpiryReaper, LockStrategy, ReaperConfig, ReservationService, StockLedger};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let app_config = config::load_config()?;
    config::init_tracing(&app_config.log_level, app_config.log_json);

    info!("reservation engine starting");

    let db = db::establish_connection_with_config(&db::DbConfig::from(&app_config))
        .await
        .map_err(|e| {
            error!(error = %e, "failed to connect to database");
            anyhow::anyhow!(e)
        })?;
    if app_config.auto_migrate {
        db::run_migrations(&db).await.map_err(|e| anyhow::anyhow!(e))?;
    }
    let db = Arc::new(db);

    // Collaborators are built here and handed in; nothing reaches for
    // process-wide state. The in-memory queue stands in for the deployment's
    // bus adapter.
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new());
    let cache = Arc::new(StockCache::new(
        app_config.reservations.stock_cache_ttl(),
    ));
    let ledger = StockLedger::new(
        LockStrategy::from_config(
            &app_config.reservations.ledger_strategy,
            app_config.reservations.ledger_retry_max,
        ),
        cache,
    );
    let service = ReservationService::new(db.clone(), ledger, app_config.reservations.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = OutboxPublisher::new(
        db.clone(),
        queue,
        PublisherConfig::from(&app_config.reservations),
        shutdown_rx.clone(),
    );
    let publisher_handle = publisher.spawn();

    let reaper = ExpiryReaper::new(
        service,
        ReaperConfig::from(&app_config.reservations),
        shutdown_rx,
    );
    let reaper_handle = reaper.spawn();

    let middleware = ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );
    let app = health::health_routes(db.clone()).layer(middleware);
    let host: IpAddr = app_config.host.parse()?;
    let addr = SocketAddr::from((host, app_config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers check the signal at batch boundaries and finish in-flight work.
    info!("shutting down background workers");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(publisher_handle, reaper_handle);

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}
