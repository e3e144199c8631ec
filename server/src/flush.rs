//! # Flush Engine
//!
//! Moves the deltas that piled up in Redis into the Postgres rollups.
//!
//! ## Cycle
//! 1. List a dirty set, nothing listed means nothing to do
//! 2. Parse each member, malformed ones are unmarked without ever touching Redis again
//! 3. `GETDEL` every well-formed key, keep the positive deltas
//! 4. Add each delta to its rollup row
//! 5. Unmark the listed keys
//!
//! Totals run first, then every day in the daily index. A daily key only counts towards the day
//! whose set it was found in, anything parked under another day is dropped.
//!
//! ## Races
//! Per key the order is always drain, then upsert, then unmark. Nothing is locked.
//!
//! - Two concurrent flushes: `GETDEL` hands the delta to exactly one of them, the other reads zero
//! - A view landing between drain and unmark: the counter holds a fresh delta while its dirty
//!   marker gets removed. The delta stays in Redis and goes out with the next flush that sees the key
//!   marked again. Dirty is a hint, the counter is the truth.
//!
//! ## Failures
//! - Redis errors bubble up before anything is unmarked, so a retry is always safe
//! - Only parsed counter keys reach the drain pipeline, so a stray member naming a set can't fail it
//! - A failed upsert loses that key's drained delta. The key stays marked, logged at error level
use std::{collections::HashSet, sync::Arc};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    database::CounterStore,
    error::StoreError,
    keys::{
        DAILY_INDEX, DIRTY_TOTALS, DailyKey, TotalKey, daily_dirty_set, parse_daily_key,
        parse_day, parse_total_key,
    },
    rollup::RollupStore,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub flushed_totals: usize,
    pub flushed_daily: usize,
}

/// What happened to one dirty set.
struct SetOutcome {
    flushed: usize,
    /// Keys left marked because their upsert failed.
    retained: Vec<String>,
    /// Listed members left untouched by the batch limit.
    truncated: bool,
}

#[derive(Clone)]
pub struct Flusher {
    counters: Arc<dyn CounterStore>,
    rollups: Arc<dyn RollupStore>,
    batch_limit: Option<usize>,
}

impl Flusher {
    pub fn new(counters: Arc<dyn CounterStore>, rollups: Arc<dyn RollupStore>) -> Self {
        Self {
            counters,
            rollups,
            batch_limit: None,
        }
    }

    /// Caps how many keys are drained per dirty set per call. The rest wait for the next call.
    pub fn with_batch_limit(mut self, batch_limit: Option<usize>) -> Self {
        self.batch_limit = batch_limit.filter(|&limit| limit > 0);
        self
    }

    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        let flushed_totals = self.flush_totals().await?;
        let flushed_daily = self.flush_daily().await?;

        info!(flushed_totals, flushed_daily, "Flush cycle complete");

        Ok(FlushReport {
            flushed_totals,
            flushed_daily,
        })
    }

    pub async fn flush_totals(&self) -> Result<usize, StoreError> {
        let listed = self.counters.members(DIRTY_TOTALS).await?;

        if listed.is_empty() {
            return Ok(0);
        }

        let (batch, truncated) = self.batch(listed);

        let parsed: Vec<(String, TotalKey)> = batch
            .iter()
            .filter_map(|key| match parse_total_key(key) {
                Some(record) => Some((key.clone(), record)),
                None => {
                    warn!(key = %key, "Dropping malformed total key");
                    None
                }
            })
            .collect();

        let drained = self.drain(parsed).await?;

        let mut outcome = SetOutcome {
            flushed: 0,
            retained: Vec::new(),
            truncated,
        };

        for (key, record, delta) in drained {
            match self.rollups.add_total(&key, &record, delta).await {
                Ok(()) => {
                    debug!(key = %key, delta, "Flushed total");
                    outcome.flushed += 1;
                }
                Err(e) => {
                    error!(key = %key, delta, error = %e, "Failed to upsert total, delta lost");
                    outcome.retained.push(key);
                }
            }
        }

        self.unmark(DIRTY_TOTALS, &batch, &outcome.retained).await?;

        if outcome.truncated {
            debug!(batch = batch.len(), "Totals batch limit reached");
        }

        Ok(outcome.flushed)
    }

    pub async fn flush_daily(&self) -> Result<usize, StoreError> {
        let days = self.counters.members(DAILY_INDEX).await?;
        let mut flushed = 0;

        for day in days {
            let set = daily_dirty_set(&day);
            let listed = self.counters.members(&set).await?;

            if listed.is_empty() {
                self.counters
                    .remove_members(DAILY_INDEX, std::slice::from_ref(&day))
                    .await?;
                continue;
            }

            let outcome = self.flush_day(&set, parse_day(&day), listed).await?;
            flushed += outcome.flushed;

            if outcome.retained.is_empty() && !outcome.truncated {
                self.counters
                    .remove_members(DAILY_INDEX, std::slice::from_ref(&day))
                    .await?;
            }

            debug!(day = %day, flushed = outcome.flushed, "Flushed day");
        }

        Ok(flushed)
    }

    async fn flush_day(
        &self,
        set: &str,
        set_day: Option<NaiveDate>,
        listed: Vec<String>,
    ) -> Result<SetOutcome, StoreError> {
        let (batch, truncated) = self.batch(listed);

        let parsed: Vec<(String, DailyKey)> = batch
            .iter()
            .filter_map(|key| match parse_daily_key(key) {
                Some(daily) if Some(daily.day) == set_day => Some((key.clone(), daily)),
                Some(_) => {
                    warn!(key = %key, set, "Dropping daily key filed under another day");
                    None
                }
                None => {
                    warn!(key = %key, "Dropping malformed daily key");
                    None
                }
            })
            .collect();

        let drained = self.drain(parsed).await?;

        let mut outcome = SetOutcome {
            flushed: 0,
            retained: Vec::new(),
            truncated,
        };

        for (key, daily, delta) in drained {
            match self.rollups.add_daily(&daily.inner, daily.day, delta).await {
                Ok(()) => outcome.flushed += 1,
                Err(e) => {
                    error!(key = %key, delta, error = %e, "Failed to upsert daily count, delta lost");
                    outcome.retained.push(key);
                }
            }
        }

        self.unmark(set, &batch, &outcome.retained).await?;

        Ok(outcome)
    }

    fn batch(&self, mut listed: Vec<String>) -> (Vec<String>, bool) {
        match self.batch_limit {
            Some(limit) if listed.len() > limit => {
                listed.truncate(limit);
                (listed, true)
            }
            _ => (listed, false),
        }
    }

    /// Drains every parsed key, keeping only positive deltas.
    async fn drain<T: Send>(
        &self,
        parsed: Vec<(String, T)>,
    ) -> Result<Vec<(String, T, i64)>, StoreError> {
        if parsed.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = parsed.iter().map(|(key, _)| key.clone()).collect();
        let deltas = self.counters.take_all(&keys).await?;

        Ok(parsed
            .into_iter()
            .zip(deltas)
            .filter_map(|((key, record), (_, delta))| (delta > 0).then_some((key, record, delta)))
            .collect())
    }

    /// Removes every listed key from the set except the ones whose upsert failed.
    async fn unmark(
        &self,
        set: &str,
        listed: &[String],
        retained: &[String],
    ) -> Result<(), StoreError> {
        let retained: HashSet<&str> = retained.iter().map(String::as_str).collect();

        let unmarked: Vec<String> = listed
            .iter()
            .filter(|key| !retained.contains(key.as_str()))
            .cloned()
            .collect();

        self.counters.remove_members(set, &unmarked).await
    }
}
