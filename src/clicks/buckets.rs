use chrono::{DateTime, Datelike, FixedOffset, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use crate::db;
use crate::error::AppResult;

/// Identifiers of the day, ISO week and month a moment falls in, on the
/// configured fixed-offset clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKeys {
    pub day: String,
    pub week: String,
    pub month: String,
}

pub fn bucket_keys(now: DateTime<Utc>, offset: FixedOffset) -> BucketKeys {
    let local = now.with_timezone(&offset);
    let iso = local.iso_week();
    BucketKeys {
        day: local.format("%Y-%m-%d").to_string(),
        week: format!("{}-W{:02}", iso.year(), iso.week()),
        month: local.format("%Y-%m").to_string(),
    }
}

/// Accumulated deltas for one novel within one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClickDelta {
    pub total: i64,
    pub today: i64,
    pub week: i64,
    pub month: i64,
}

/// Fold stamped clicks into per-novel deltas. Clicks stamped with a bucket
/// that is no longer current only count towards the total.
pub fn fold(
    pending: &HashMap<(i64, BucketKeys), i64>,
    current: &BucketKeys,
) -> HashMap<i64, ClickDelta> {
    let mut deltas: HashMap<i64, ClickDelta> = HashMap::new();
    for ((novel_id, keys), count) in pending {
        let delta = deltas.entry(*novel_id).or_default();
        delta.total += count;
        if keys.day == current.day {
            delta.today += count;
        }
        if keys.week == current.week {
            delta.week += count;
        }
        if keys.month == current.month {
            delta.month += count;
        }
    }
    deltas
}

/// Zero every counter whose bucket changed since it was last rolled.
/// Returns the kinds that rolled; running it twice in a bucket is a no-op.
pub fn rollover(conn: &Connection, keys: &BucketKeys) -> AppResult<Vec<&'static str>> {
    let mut rolled = Vec::new();
    for (kind, column, key) in [
        ("day", "today_clicks", &keys.day),
        ("week", "week_clicks", &keys.week),
        ("month", "month_clicks", &keys.month),
    ] {
        let stored: Option<String> = conn
            .query_row(
                "SELECT bucket FROM click_buckets WHERE kind = ?1",
                params![kind],
                |r| r.get(0),
            )
            .optional()?;
        if stored.as_deref() == Some(key.as_str()) {
            continue;
        }

        conn.execute(
            &format!("UPDATE novels SET {column} = 0 WHERE {column} != 0"),
            [],
        )?;
        conn.execute(
            "INSERT INTO click_buckets (kind, bucket, rolled_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET bucket = excluded.bucket, rolled_at = excluded.rolled_at",
            params![kind, key, db::timestamp(Utc::now())],
        )?;
        rolled.push(kind);
    }
    Ok(rolled)
}

/// Apply one flush: roll buckets first so new-bucket clicks are not zeroed
/// afterwards, then one UPDATE per novel.
pub fn apply(
    conn: &Connection,
    deltas: &HashMap<i64, ClickDelta>,
    current: &BucketKeys,
) -> AppResult<Vec<&'static str>> {
    db::immediate_transaction(conn, |conn| {
        let rolled = rollover(conn, current)?;
        let mut stmt = conn.prepare_cached(
            "UPDATE novels SET click_count = click_count + ?2,
                               today_clicks = today_clicks + ?3,
                               week_clicks = week_clicks + ?4,
                               month_clicks = month_clicks + ?5
             WHERE id = ?1",
        )?;
        for (novel_id, d) in deltas {
            stmt.execute(params![novel_id, d.total, d.today, d.week, d.month])?;
        }
        Ok(rolled)
    })
}
