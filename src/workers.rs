//! Long-lived background tasks. All of them stop when `shutdown` is cancelled.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clicks::{self, ClickAggregator};
use crate::error::AppResult;
use crate::ingest::ParseWorkerPool;
use crate::parser::ChapterParser;
use crate::review;
use crate::state::{AppState, Channels};

pub fn spawn(
    state: &AppState,
    channels: Channels,
    shutdown: CancellationToken,
) -> AppResult<Vec<JoinHandle<()>>> {
    let config = &state.config;
    let parser = Arc::new(ChapterParser::new(&config.parser.heading_patterns)?);

    let mut handles = ParseWorkerPool::new(
        state.novels.clone(),
        state.blobs.clone(),
        parser,
        state.cache.clone(),
        state.activity.clone(),
        &config.parser,
    )
    .spawn(channels.parse_jobs, config.parser.workers, shutdown.clone());

    let offset = state.clicks.offset();
    handles.push(
        ClickAggregator::new(state.db.clone(), state.cache.clone(), offset).spawn(
            channels.clicks,
            Duration::from_millis(config.clicks.flush_interval_ms.max(1)),
            shutdown.clone(),
        ),
    );
    handles.push(clicks::spawn_rollover(
        state.db.clone(),
        state.cache.clone(),
        &config.clicks,
        offset,
        shutdown.clone(),
    ));
    handles.push(review::spawn_sweeper(
        state.review.clone(),
        Duration::from_secs(config.review.sweep_interval_secs.max(1)),
        shutdown.clone(),
    ));
    handles.push(spawn_cache_purge(
        state.clone(),
        Duration::from_secs(config.cache.purge_interval_secs.max(1)),
        shutdown.clone(),
    ));
    handles.push(spawn_requeue(state.clone(), shutdown));

    Ok(handles)
}

fn spawn_cache_purge(
    state: AppState,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = state.cache.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, remaining = state.cache.len(), "cache purged");
                    }
                }
            }
        }
    })
}

/// Put novels whose parse never finished back on the queue.
fn spawn_requeue(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ids = match state.novels.unfinished_parse_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "could not list unparsed novels");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "re-enqueueing unfinished parses");
        for id in ids {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                sent = state.parse_queue.enqueue(id) => {
                    if let Err(e) = sent {
                        tracing::warn!(novel_id = id, error = %e, "requeue stopped");
                        return;
                    }
                }
            }
        }
    })
}
