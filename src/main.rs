use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use entitlement_engine::billing::{BillingService, CleanupDrainer, HttpResourceDeleter};
use entitlement_engine::config;
use entitlement_engine::extractor::CronSecret;
use entitlement_engine::routes;
use entitlement_engine::store::{BillingStore, PgStore};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    if config::CRON_SECRET.is_none() {
        tracing::warn!("CRON_SECRET is not set; cleanup triggers will be rejected");
    }

    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("connecting to postgres")?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("running migrations");
        }
    }

    let store: Arc<dyn BillingStore> = Arc::new(PgStore::new(pool));
    let service = BillingService::new(
        store.clone(),
        *config::STORE_TIMEOUT,
        *config::USAGE_ENRICHMENT_CONCURRENCY,
    );
    let deleter = HttpResourceDeleter::new(
        config::EXTERNAL_RESOURCE_API_BASE.as_str(),
        config::EXTERNAL_RESOURCE_API_TOKEN.clone(),
    )
    .context("building external resource client")?;
    let drainer = CleanupDrainer::new(store, Arc::new(deleter), *config::STORE_TIMEOUT)
        .with_batch_limits(*config::CLEANUP_BATCH_SIZE, *config::CLEANUP_MAX_BATCH_SIZE);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = routes::app(service, drainer, CronSecret(config::CRON_SECRET.clone()))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("parsing bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
