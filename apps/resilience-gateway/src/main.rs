use core_config::tracing::{init_tracing, install_color_eyre};
use db_resilience::change_stream::{ChangeStreamManager, ManagedFeedSource};
use db_resilience::circuit_breaker::CircuitBreakerRegistry;
use db_resilience::connection::{ConnectionManager, ManagedConnection};
use db_resilience::health::{health_router, ConnectionHealthMonitor, HealthCheckService, HealthRouterState};
use db_resilience::metrics::{init_metrics, MetricsCollector};
use db_resilience::mongodb::{MongoConnector, MongoFeedSource, MongoTokenStore};
use db_resilience::{graceful_shutdown, ShutdownCoordinator};
use std::sync::Arc;
use tracing::{info, warn};

mod bridge;
mod config;

use bridge::LoggingBridge;
use config::Config;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Install color-eyre first for colored error output
    install_color_eyre();

    let config = Config::from_env()?;
    init_tracing(&config.environment);

    let resilience = config.resilience.clone();
    init_metrics()?;

    info!(database = %resilience.mongo.database(), "Connecting to MongoDB");
    let breakers = Arc::new(CircuitBreakerRegistry::new(resilience.breaker.clone()));
    let manager = ConnectionManager::with_breakers(
        MongoConnector::new(resilience.mongo.clone()),
        resilience.connection.clone(),
        breakers.clone(),
    );
    manager.connect().await?;

    // Health monitoring and metrics observe the manager, they never block it
    let connection: Arc<dyn ManagedConnection> = Arc::new(manager.clone());
    let monitor = Arc::new(ConnectionHealthMonitor::new(connection.clone(), resilience.monitor.clone()));
    let service = Arc::new(HealthCheckService::new(connection, resilience.health.clone()).with_monitor(monitor.clone()));
    service.spawn_listener(monitor.subscribe(), manager.subscribe(), breakers.subscribe());

    let metrics = Arc::new(MetricsCollector::new(resilience.metrics.clone()));
    metrics.spawn(manager.subscribe(), monitor.subscribe());
    metrics.watch_circuits(breakers.subscribe());
    monitor.start();

    let change_streams = Arc::new(ChangeStreamManager::new(
        // Both resolve the manager's current client, so recovery does not strand them
        Arc::new(ManagedFeedSource::new(
            manager.clone(),
            MongoFeedSource::new(resilience.mongo.database()).with_full_document(resilience.change_streams.full_document),
        )),
        Arc::new(MongoTokenStore::new(manager.clone())),
        resilience.change_streams.clone(),
    )?);
    service.spawn_change_stream_listener(change_streams.subscribe());
    metrics.watch_change_streams(change_streams.subscribe());

    let bridge = LoggingBridge::new();
    for collection in &resilience.change_streams.collections {
        change_streams.add_listener(collection, bridge.clone());
    }
    change_streams.initialize().await?;

    let state = HealthRouterState::new(service.clone(), monitor.clone(), breakers)
        .with_change_streams(change_streams.clone())
        .with_metrics(metrics.clone());
    let app = health_router(state);

    let (coordinator, _) = ShutdownCoordinator::new();
    let signals = coordinator.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    let listener = tokio::net::TcpListener::bind(config.server.address()).await?;
    info!("Resilience gateway listening on {}", listener.local_addr()?);

    let server_shutdown = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await
        .inspect_err(|e| tracing::error!("Server encountered an error: {:?}", e))?;

    let finished = graceful_shutdown(
        async move {
            info!("Shutting down: closing change streams");
            change_streams.close().await;
            monitor.stop().await;
            metrics.stop();
            service.stop_listeners();
            manager.disconnect().await;
            info!(published = bridge.published(), "MongoDB connection closed");
        },
        config.shutdown_timeout,
    )
    .await;
    if !finished {
        warn!("Shutdown cleanup did not finish in time");
    }

    info!("Resilience gateway shutdown complete");
    Ok(())
}
