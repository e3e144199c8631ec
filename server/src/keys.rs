//! # Counter Keys
//!
//! Every countable thing lives under one Redis string key.
//!
//! ## Families
//!
//! - Totals: `views:<namespace>:<entityId>`, or `views:path:<path>` for raw paths
//! - Daily: `views:daily:<YYYY-MM-DD>:<total key>`
//!
//! ## Dirty Sets
//!
//! - `views:dirty`: every total key that may hold an unflushed delta
//! - `views:dirty:daily:<day>`: the daily keys touched on that day
//! - `views:dirty:daily-index`: the days that have a daily dirty set
//!
//! Membership is only a hint. The counter value itself is the source of truth and is
//! drained with `GETDEL`, so a stale member costs one empty round trip and nothing else.
use chrono::NaiveDate;

pub const PREFIX: &str = "views:";
pub const PATH_NAMESPACE: &str = "path";
pub const DAILY_PREFIX: &str = "views:daily:";

pub const DIRTY_TOTALS: &str = "views:dirty";
pub const DAILY_INDEX: &str = "views:dirty:daily-index";
pub const DAILY_DIRTY_PREFIX: &str = "views:dirty:daily:";

const DAY_FORMAT: &str = "%Y-%m-%d";
const DAY_LEN: usize = 10;

const RESERVED_NAMESPACES: [&str; 2] = ["daily", "dirty"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalKey {
    pub namespace: String,
    pub entity_id: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyKey {
    pub day: NaiveDate,
    /// The wrapped total key, verbatim.
    pub inner: String,
    pub total: TotalKey,
}

pub fn total_key(namespace: &str, entity_id: &str) -> String {
    format!("{PREFIX}{namespace}:{entity_id}")
}

pub fn path_key(path: &str) -> String {
    format!("{PREFIX}{PATH_NAMESPACE}:{path}")
}

pub fn daily_key(day: NaiveDate, inner: &str) -> String {
    format!("{DAILY_PREFIX}{}:{inner}", format_day(day))
}

pub fn daily_dirty_set(day: &str) -> String {
    format!("{DAILY_DIRTY_PREFIX}{day}")
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn parse_day(day: &str) -> Option<NaiveDate> {
    if day.len() != DAY_LEN {
        return None;
    }

    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}

/// Returns `None` for anything that is not a total key. Callers skip those silently.
pub fn parse_total_key(key: &str) -> Option<TotalKey> {
    let rest = key.strip_prefix(PREFIX)?;

    if let Some(path) = rest.strip_prefix("path:") {
        let path = if path.is_empty() { "/" } else { path };

        return Some(TotalKey {
            namespace: PATH_NAMESPACE.to_string(),
            entity_id: None,
            path: Some(path.to_string()),
        });
    }

    let (namespace, entity_id) = rest.split_once(':')?;

    if namespace.is_empty() || entity_id.is_empty() || RESERVED_NAMESPACES.contains(&namespace) {
        return None;
    }

    Some(TotalKey {
        namespace: namespace.to_string(),
        entity_id: Some(entity_id.to_string()),
        path: None,
    })
}

pub fn parse_daily_key(key: &str) -> Option<DailyKey> {
    let rest = key.strip_prefix(DAILY_PREFIX)?;

    let day = parse_day(rest.get(..DAY_LEN)?)?;
    let inner = rest.get(DAY_LEN..)?.strip_prefix(':')?;
    let total = parse_total_key(inner)?;

    Some(DailyKey {
        day,
        inner: inner.to_string(),
        total,
    })
}
