//! Popularity counters.
//!
//! Handlers submit clicks without waiting; a single aggregator task folds
//! them per novel and writes one UPDATE per novel per flush.

pub mod buckets;

use chrono::{FixedOffset, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{Cache, NOVEL_LIST_TAG};
use crate::config::ClickConfig;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::state::DbPool;

pub use buckets::{bucket_keys, BucketKeys};

#[derive(Debug)]
struct ClickEvent {
    novel_id: i64,
    keys: BucketKeys,
}

/// Cheap handle for submitting clicks.
#[derive(Clone)]
pub struct ClickRecorder {
    tx: mpsc::Sender<ClickEvent>,
    offset: FixedOffset,
}

/// Receiving half, consumed by [`ClickAggregator`].
pub struct ClickStream {
    rx: mpsc::Receiver<ClickEvent>,
}

pub fn clock_offset(hours: i32) -> AppResult<FixedOffset> {
    FixedOffset::east_opt(hours * 3600)
        .ok_or_else(|| AppError::Internal(format!("invalid utc offset {}h", hours)))
}

impl ClickRecorder {
    pub fn new(capacity: usize, offset: FixedOffset) -> (Self, ClickStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, offset }, ClickStream { rx })
    }

    /// Best effort: when the aggregator is saturated the click is dropped.
    pub fn record(&self, novel_id: i64) {
        let event = ClickEvent {
            novel_id,
            keys: bucket_keys(Utc::now(), self.offset),
        };
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(novel_id, error = %e, "click dropped");
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

pub struct ClickAggregator {
    pool: DbPool,
    cache: Cache,
    offset: FixedOffset,
    pending: HashMap<(i64, BucketKeys), i64>,
}

impl ClickAggregator {
    pub fn new(pool: DbPool, cache: Cache, offset: FixedOffset) -> Self {
        Self {
            pool,
            cache,
            offset,
            pending: HashMap::new(),
        }
    }

    fn add(&mut self, event: ClickEvent) {
        *self.pending.entry((event.novel_id, event.keys)).or_insert(0) += 1;
    }

    /// Write pending clicks. A failed flush drops its batch.
    pub fn flush(&mut self) -> AppResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut self.pending);
        let current = bucket_keys(Utc::now(), self.offset);
        let deltas = buckets::fold(&pending, &current);

        let conn = self.pool.get()?;
        let rolled = buckets::apply(&conn, &deltas, &current)?;
        if !rolled.is_empty() {
            tracing::info!(?rolled, "click buckets rolled over");
        }

        let ids: Vec<i64> = deltas.keys().copied().collect();
        self.cache.invalidate_novels(&ids);
        Ok(ids.len())
    }

    pub fn spawn(
        mut self,
        mut stream: ClickStream,
        flush_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("click aggregator started");
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(event) = stream.rx.recv() => self.add(event),
                    _ = ticker.tick() => self.flush_logged(),
                }
            }

            while let Ok(event) = stream.rx.try_recv() {
                self.add(event);
            }
            self.flush_logged();
            tracing::info!("click aggregator stopped");
        })
    }

    fn flush_logged(&mut self) {
        match self.flush() {
            Ok(0) => {}
            Ok(novels) => tracing::debug!(novels, "clicks flushed"),
            Err(e) => tracing::error!(error = %e, "click flush failed, batch dropped"),
        }
    }
}

/// Zero counters at bucket boundaries even when nobody is clicking.
pub fn spawn_rollover(
    pool: DbPool,
    cache: Cache,
    config: &ClickConfig,
    offset: FixedOffset,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = Duration::from_secs(config.rollover_check_secs.max(1));
    tokio::spawn(async move {
        tracing::info!("click rollover scheduler started");
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match roll_now(&pool, offset) {
                        Ok(rolled) if !rolled.is_empty() => {
                            tracing::info!(?rolled, "click buckets rolled over");
                            cache.invalidate_tag(NOVEL_LIST_TAG);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "click rollover failed"),
                    }
                }
            }
        }
        tracing::info!("click rollover scheduler stopped");
    })
}

pub fn roll_now(pool: &DbPool, offset: FixedOffset) -> AppResult<Vec<&'static str>> {
    let conn = pool.get()?;
    let keys = bucket_keys(Utc::now(), offset);
    db::immediate_transaction(&conn, |conn| buckets::rollover(conn, &keys))
}
