pub mod aggregator;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod model;
pub mod service;
pub mod source;
pub mod store;

use aggregator::Aggregator;
use config::{Config, StoreConfig};
use errors::NeoCountError;
use service::NeoCountService;
use shared::admin_service::{AdminService, Readiness};
use shared::http::run_http_service;
use source::FeedClient;
use std::sync::Arc;
use store::{CountStore, MemoryCountStore, PostgresCountStore};
use tokio_util::sync::CancellationToken;

/// Serves the count API (and the admin probes, when configured) until
/// `shutdown` is cancelled.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), NeoCountError> {
    config.validate()?;

    let store: Arc<dyn CountStore> = match &config.store {
        StoreConfig::Postgres(postgres) => Arc::new(PostgresCountStore::connect(postgres).await?),
        StoreConfig::Memory => {
            tracing::warn!("Using the in-memory count store, written counts are not durable");
            Arc::new(MemoryCountStore::new())
        }
    };

    let mut aggregator = Aggregator::new(Arc::new(FeedClient::new(&config.catalog)));
    if let Some(width) = config.catalog.max_concurrent_lookups {
        aggregator = aggregator.with_max_concurrency(width);
    }

    let service = NeoCountService::new(aggregator, store, shutdown.clone())
        .with_lookup_deadline(config.catalog.lookup_deadline());

    let readiness = Readiness::new();
    readiness.set_ready(true);
    let shutdown_readiness = readiness.clone();
    let shutdown_watch = shutdown.clone();
    tokio::spawn(async move {
        shutdown_watch.cancelled().await;
        shutdown_readiness.set_ready(false);
    });

    let api_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        service,
        shutdown.clone(),
    );

    match &config.admin_listener {
        Some(admin) => {
            let admin_task = run_http_service(
                &admin.host,
                admin.port,
                AdminService::<NeoCountError>::new(readiness),
                shutdown.clone(),
            );
            tokio::try_join!(api_task, admin_task)?;
        }
        None => api_task.await?,
    }

    tracing::info!("Count service stopped");
    Ok(())
}

/// Prepares the configured store for writes.
pub async fn migrate(config: &Config) -> Result<(), NeoCountError> {
    config.validate()?;

    match &config.store {
        StoreConfig::Postgres(postgres) => {
            PostgresCountStore::connect(postgres)
                .await?
                .ensure_schema()
                .await?;
        }
        StoreConfig::Memory => tracing::info!("In-memory store needs no migration"),
    }
    Ok(())
}
