//! # Redis
//!
//! RAM database.
//!
//! Core purpose is to absorb view increments at request speed. Producers only ever `INCRBY` a counter
//! and `SADD` its key into a dirty set, the flush engine is the only reader and deleter of counters.
//!
//! ## Requirements
//!
//! - Atomic increments from many stateless handlers
//! - Atomic get-and-delete so every unit of delta is drained exactly once
//! - Set membership for the dirty sets
//!
//! ## Implementation
//!
//! - One string key per counter, holding the delta since its last flush
//! - `GETDEL` drains a counter, a missing key reads as zero
//! - Drains are pipelined, one `GETDEL` per key, so a batch costs one round trip
//! - No locks: concurrent flushes race on `GETDEL` and exactly one of them sees the delta
use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    error::StoreError,
    keys::{DAILY_INDEX, DIRTY_TOTALS, daily_dirty_set, daily_key, format_day},
};

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically reads and deletes a counter. Absent counters read as zero.
    async fn take(&self, key: &str) -> Result<i64, StoreError>;

    async fn take_all(&self, keys: &[String]) -> Result<Vec<(String, i64)>, StoreError> {
        let mut drained = Vec::with_capacity(keys.len());

        for key in keys {
            drained.push((key.clone(), self.take(key).await?));
        }

        Ok(drained)
    }

    async fn remove_members(&self, set: &str, members: &[String]) -> Result<(), StoreError>;

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    async fn add_member(&self, set: &str, member: &str) -> Result<(), StoreError>;
}

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

fn parse_delta(key: &str, raw: Option<String>) -> i64 {
    let Some(raw) = raw else {
        return 0;
    };

    raw.parse().unwrap_or_else(|_| {
        warn!(key, raw = %raw, "Counter holds a non-integer value, dropping it");
        0
    })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();

        Ok(connection.smembers(set).await?)
    }

    async fn take(&self, key: &str) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();

        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        Ok(parse_delta(key, raw))
    }

    async fn take_all(&self, keys: &[String]) -> Result<Vec<(String, i64)>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.connection.clone();
        let mut pipe = redis::pipe();

        for key in keys {
            pipe.cmd("GETDEL").arg(key);
        }

        let raw: Vec<Option<String>> = pipe.query_async(&mut connection).await?;

        Ok(keys
            .iter()
            .zip(raw)
            .map(|(key, raw)| (key.clone(), parse_delta(key, raw)))
            .collect())
    }

    async fn remove_members(&self, set: &str, members: &[String]) -> Result<(), StoreError> {
        // SREM with no members is a syntax error
        if members.is_empty() {
            return Ok(());
        }

        let mut connection = self.connection.clone();
        let _: () = connection.srem(set, members).await?;

        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();

        Ok(connection.incr(key, by).await?)
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.sadd(set, member).await?;

        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    counters: HashMap<String, i64>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// Process-local stand-in for Redis. Every call is one "round trip" and is counted.
#[derive(Default)]
pub struct MemoryCounterStore {
    state: Mutex<MemoryState>,
    operations: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Makes every following call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn value(&self, key: &str) -> Option<i64> {
        self.state.lock().await.counters.get(key).copied()
    }

    pub async fn contains(&self, set: &str, member: &str) -> bool {
        self.state
            .lock()
            .await
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member))
    }

    fn begin(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory counter store".to_string()));
        }

        self.operations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.begin()?;

        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn take(&self, key: &str) -> Result<i64, StoreError> {
        self.begin()?;

        Ok(self.state.lock().await.counters.remove(key).unwrap_or(0))
    }

    async fn remove_members(&self, set: &str, members: &[String]) -> Result<(), StoreError> {
        self.begin()?;

        let mut state = self.state.lock().await;
        if let Some(existing) = state.sets.get_mut(set) {
            for member in members {
                existing.remove(member);
            }

            if existing.is_empty() {
                state.sets.remove(set);
            }
        }

        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.begin()?;

        let mut state = self.state.lock().await;
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value += by;

        Ok(*value)
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.begin()?;

        self.state
            .lock()
            .await
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());

        Ok(())
    }
}

/// Producer side of the cache: what a page handler calls once per view.
pub struct ViewRecorder<'a> {
    counters: &'a dyn CounterStore,
}

impl<'a> ViewRecorder<'a> {
    pub fn new(counters: &'a dyn CounterStore) -> Self {
        Self { counters }
    }

    /// Counts one view of `key` towards its lifetime total and towards `day`.
    pub async fn record(&self, key: &str, day: NaiveDate) -> Result<(), StoreError> {
        self.counters.increment(key, 1).await?;
        self.counters.add_member(DIRTY_TOTALS, key).await?;

        let day_str = format_day(day);
        let daily = daily_key(day, key);

        self.counters.increment(&daily, 1).await?;
        self.counters
            .add_member(&daily_dirty_set(&day_str), &daily)
            .await?;
        self.counters.add_member(DAILY_INDEX, &day_str).await?;

        Ok(())
    }
}
