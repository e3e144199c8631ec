use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use super::{
    auth::AuthGuard,
    config::Config,
    database::{CounterStore, RedisCounterStore, init_redis},
    flush::Flusher,
    rollup::{PgRollupStore, RollupStore},
};

pub struct State {
    pub config: Config,
    pub flusher: Flusher,
    pub guard: AuthGuard,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        info!("Connecting to Redis...");
        let redis_connection = init_redis(&config.redis_url)
            .await
            .context("failed to connect to Redis")?;

        info!("Connecting to Postgres...");
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;

        let rollups = PgRollupStore::new(pool);
        rollups
            .init()
            .await
            .context("failed to migrate rollup tables")?;

        Ok(Self::with_stores(
            config,
            Arc::new(RedisCounterStore::new(redis_connection)),
            Arc::new(rollups),
        ))
    }

    pub fn with_stores(
        config: Config,
        counters: Arc<dyn CounterStore>,
        rollups: Arc<dyn RollupStore>,
    ) -> Arc<Self> {
        let flusher = Flusher::new(counters, rollups).with_batch_limit(config.batch_limit);
        let guard = AuthGuard::new(
            config.flush_secret.clone(),
            config.environment,
            config.allow_unauthenticated,
        );

        Arc::new(Self {
            config,
            flusher,
            guard,
        })
    }
}
