use actix::prelude::*;
use anyhow::Context as _;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_lifecycle::actors::ReconcilerActor;
use order_lifecycle::cache::{CacheStore, MemoryCacheStore, OrderCache, RedisCacheStore};
use order_lifecycle::concurrency::{DistributedLock, LockStore, MemoryLockStore, OptimisticGuard, RedisLockStore};
use order_lifecycle::config::AppConfig;
use order_lifecycle::domain::payment::PaymentMethod;
use order_lifecycle::gateway::{GatewayRegistry, HttpGateway};
use order_lifecycle::metrics::{self, Metrics};
use order_lifecycle::services::{AppContext, NoDiscounts, Services};
use order_lifecycle::storage::{MemoryOrderStore, OrderStore, PgOrderStore};
use order_lifecycle::utils::{retry_with_backoff, RetryConfig};

#[actix::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,order_lifecycle=debug")))
        .init();

    tracing::info!("Starting order lifecycle service");
    let config = AppConfig::from_env()?;

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("Metrics registry created with {} metrics", metrics.registry().gather().len());

    let registry = metrics.registry().clone();
    let metrics_port = config.metrics_port;
    actix::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(registry, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 2. Order store ===
    let store: Arc<dyn OrderStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = retry_with_backoff(RetryConfig::patient(), |_attempt| {
                PgPoolOptions::new().max_connections(16).connect(url)
            })
            .await
            .into_result()
            .context("could not connect to PostgreSQL")?;
            let store = PgOrderStore::new(pool);
            store.migrate().await.context("migrations failed")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, orders are kept in memory");
            Arc::new(MemoryOrderStore::new())
        }
    };

    // === 3. Lock and cache backends ===
    let (lock_store, cache_store): (Arc<dyn LockStore>, Arc<dyn CacheStore>) = match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
            let conn = retry_with_backoff(RetryConfig::patient(), |_attempt| {
                client.get_multiplexed_async_connection()
            })
            .await
            .into_result()
            .context("could not connect to Redis")?;
            (
                Arc::new(RedisLockStore::new(conn.clone())),
                Arc::new(RedisCacheStore::new(conn)),
            )
        }
        None => {
            tracing::warn!("REDIS_URL not set, locks and cache are process-local");
            (Arc::new(MemoryLockStore::new()), Arc::new(MemoryCacheStore::new()))
        }
    };

    // === 4. Payment gateways ===
    let mut gateways = GatewayRegistry::new(config.gateways.timeout, metrics.clone());
    for (method, url) in [
        (PaymentMethod::Card, &config.gateways.card_url),
        (PaymentMethod::Wallet, &config.gateways.wallet_url),
    ] {
        match url {
            Some(url) => gateways.register(Arc::new(HttpGateway::new(method, url.clone(), config.gateways.timeout)?)),
            None => tracing::warn!(method = %method, "No gateway configured, payments with this method will fail"),
        }
    }

    // === 5. Services ===
    let lock = DistributedLock::new(lock_store, config.lock.ttl);
    let ctx = Arc::new(AppContext {
        store,
        guard: OptimisticGuard::new(lock, config.retry.clone(), metrics.clone()),
        cache: OrderCache::new(cache_store, config.cache.clone(), metrics.clone()),
        gateways,
        discounts: Arc::new(NoDiscounts),
        metrics: metrics.clone(),
        config: config.clone(),
    });
    let services = Services::new(ctx);

    // === 6. Expiry reconciler ===
    let _reconciler = ReconcilerActor::new(services.reconciler.clone(), config.reconciler.interval).start();

    tracing::info!("Order lifecycle service ready");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    System::current().stop();
    Ok(())
}
