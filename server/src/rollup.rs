//! # Postgres
//!
//! Durable rollups of the Redis counters.
//!
//! ## Schema
//! - `view_totals`: one row per total key, `total` is the lifetime view count
//! - `view_daily`: one row per (total key, UTC day), `count` is the views on that day
//!
//! ## Writes
//! Rows are only ever increased by a drained delta with `INSERT .. ON CONFLICT DO UPDATE SET total = total + delta`.
//! Never set to an absolute value, so two flushes that each drained their own delta both land.
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tokio::sync::RwLock;

use crate::{error::StoreError, keys::TotalKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct TotalRecord {
    pub key: String,
    pub namespace: String,
    pub entity_id: Option<String>,
    pub path: Option<String>,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DailyRecord {
    pub key: String,
    pub day: NaiveDate,
    pub count: i64,
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn init(&self) -> Result<(), StoreError>;

    /// Creates the row with `total = delta`, or adds `delta` to the existing total.
    async fn add_total(&self, key: &str, record: &TotalKey, delta: i64) -> Result<(), StoreError>;

    async fn add_daily(&self, key: &str, day: NaiveDate, delta: i64) -> Result<(), StoreError>;

    async fn get_total(&self, key: &str) -> Result<Option<TotalRecord>, StoreError>;

    async fn get_daily(&self, key: &str, day: NaiveDate)
    -> Result<Option<DailyRecord>, StoreError>;
}

#[derive(Clone)]
pub struct PgRollupStore {
    pool: PgPool,
}

impl PgRollupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RollupStore for PgRollupStore {
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        Ok(())
    }

    async fn add_total(&self, key: &str, record: &TotalKey, delta: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO view_totals (key, namespace, entity_id, path, total)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO UPDATE
            SET
                total = view_totals.total + EXCLUDED.total,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&record.namespace)
        .bind(&record.entity_id)
        .bind(&record.path)
        .bind(delta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_daily(&self, key: &str, day: NaiveDate, delta: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO view_daily (key, day, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, day) DO UPDATE
            SET
                count = view_daily.count + EXCLUDED.count,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(day)
        .bind(delta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_total(&self, key: &str) -> Result<Option<TotalRecord>, StoreError> {
        let record = sqlx::query_as::<_, TotalRecord>(
            r#"
            SELECT key, namespace, entity_id, path, total
            FROM view_totals
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_daily(
        &self,
        key: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyRecord>, StoreError> {
        let record = sqlx::query_as::<_, DailyRecord>(
            r#"
            SELECT key, day, count
            FROM view_daily
            WHERE key = $1 AND day = $2
            "#,
        )
        .bind(key)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[derive(Default)]
pub struct MemoryRollupStore {
    totals: RwLock<HashMap<String, TotalRecord>>,
    daily: RwLock<HashMap<(String, NaiveDate), DailyRecord>>,
    failing: RwLock<HashSet<String>>,
    writes: AtomicUsize,
}

impl MemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every upsert for `key` fails until [`Self::recover`] is called.
    pub async fn fail_on(&self, key: &str) {
        self.failing.write().await.insert(key.to_string());
    }

    pub async fn recover(&self, key: &str) {
        self.failing.write().await.remove(key);
    }

    pub async fn total_rows(&self) -> usize {
        self.totals.read().await.len()
    }

    pub async fn daily_rows(&self) -> Vec<DailyRecord> {
        self.daily.read().await.values().cloned().collect()
    }

    async fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.failing.read().await.contains(key) {
            return Err(StoreError::Unavailable(format!("upsert of {key} rejected")));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RollupStore for MemoryRollupStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_total(&self, key: &str, record: &TotalKey, delta: i64) -> Result<(), StoreError> {
        self.check(key).await?;

        let mut totals = self.totals.write().await;
        totals
            .entry(key.to_string())
            .and_modify(|row| row.total += delta)
            .or_insert_with(|| TotalRecord {
                key: key.to_string(),
                namespace: record.namespace.clone(),
                entity_id: record.entity_id.clone(),
                path: record.path.clone(),
                total: delta,
            });

        Ok(())
    }

    async fn add_daily(&self, key: &str, day: NaiveDate, delta: i64) -> Result<(), StoreError> {
        self.check(key).await?;

        let mut daily = self.daily.write().await;
        daily
            .entry((key.to_string(), day))
            .and_modify(|row| row.count += delta)
            .or_insert_with(|| DailyRecord {
                key: key.to_string(),
                day,
                count: delta,
            });

        Ok(())
    }

    async fn get_total(&self, key: &str) -> Result<Option<TotalRecord>, StoreError> {
        Ok(self.totals.read().await.get(key).cloned())
    }

    async fn get_daily(
        &self,
        key: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyRecord>, StoreError> {
        Ok(self
            .daily
            .read()
            .await
            .get(&(key.to_string(), day))
            .cloned())
    }
}
