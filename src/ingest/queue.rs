//! Bounded parse queue and the worker pool draining it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::IngestError;
use crate::activity::{ActivityEntry, ActivityRecorder};
use crate::blob::BlobArea;
use crate::cache::Cache;
use crate::config::ParserConfig;
use crate::error::{AppError, AppResult};
use crate::novels::{DynNovelRepository, Novel};
use crate::parser::{ChapterParser, FileKind};

/// Sending half, cloned into every service that schedules parses.
#[derive(Clone)]
pub struct ParseQueue {
    tx: mpsc::Sender<i64>,
}

/// Receiving half, handed to [`ParseWorkerPool::spawn`].
pub struct ParseJobs {
    rx: mpsc::Receiver<i64>,
}

impl ParseQueue {
    pub fn new(capacity: usize) -> (Self, ParseJobs) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ParseJobs { rx })
    }

    /// Never waits: a full queue is reported and the novel stays `unparsed`
    /// until the next restart picks it up.
    pub fn try_enqueue(&self, novel_id: i64) -> Result<(), IngestError> {
        self.tx.try_send(novel_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::ParseQueueFull,
            mpsc::error::TrySendError::Closed(_) => IngestError::ParseQueueClosed,
        })
    }

    /// Waits for room. Only for callers off the request path.
    pub async fn enqueue(&self, novel_id: i64) -> Result<(), IngestError> {
        self.tx
            .send(novel_id)
            .await
            .map_err(|_| IngestError::ParseQueueClosed)
    }
}

/// Everything a worker needs to turn a stored blob into chapter rows.
pub struct ParseWorkerPool {
    novels: DynNovelRepository,
    blobs: BlobArea,
    parser: Arc<ChapterParser>,
    cache: Cache,
    activity: ActivityRecorder,
    max_attempts: u32,
    backoff_base: Duration,
}

impl ParseWorkerPool {
    pub fn new(
        novels: DynNovelRepository,
        blobs: BlobArea,
        parser: Arc<ChapterParser>,
        cache: Cache,
        activity: ActivityRecorder,
        config: &ParserConfig,
    ) -> Self {
        Self {
            novels,
            blobs,
            parser,
            cache,
            activity,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Start `workers` tasks sharing one receiver.
    pub fn spawn(
        self,
        jobs: ParseJobs,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        let rx = Arc::new(Mutex::new(jobs.rx));

        (0..workers.max(1))
            .map(|worker| {
                let pool = Arc::clone(&pool);
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::info!(worker, "parse worker started");
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => None,
                            id = async { rx.lock().await.recv().await } => id,
                        };
                        let Some(novel_id) = next else { break };
                        pool.run(novel_id, &shutdown).await;
                    }
                    tracing::info!(worker, "parse worker stopped");
                })
            })
            .collect()
    }

    /// Parse one novel with bounded retries. Never returns an error: the
    /// outcome is recorded on the novel row.
    pub async fn run(&self, novel_id: i64, shutdown: &CancellationToken) {
        let novel = match self.claim(novel_id).await {
            Ok(Some(novel)) => novel,
            Ok(None) => {
                tracing::debug!(novel_id, "nothing to parse");
                return;
            }
            Err(e) => {
                tracing::warn!(novel_id, error = %e, "could not claim novel for parsing");
                return;
            }
        };

        let mut attempt = 1;
        loop {
            match self.attempt(&novel).await {
                Ok(words) => {
                    tracing::info!(novel_id, words, attempt, "novel parsed");
                    self.cache.invalidate_novel(novel_id);
                    return;
                }
                // Bad file contents fail the same way every time.
                Err(e) if attempt < self.max_attempts && !matches!(e, AppError::Parse(_)) => {
                    let pause = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(novel_id, attempt, error = %e, ?pause, "parse attempt failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::info!(novel_id, "parse abandoned at shutdown");
                            return;
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(novel_id, attempt, error = %e, "parse failed permanently");
                    if let Err(mark_err) = self.novels.mark_parse_failed(novel_id).await {
                        tracing::error!(novel_id, error = %mark_err, "could not mark parse failure");
                    }
                    self.activity.record(
                        ActivityEntry::new(novel.uploader_id, "parse_novel", false)
                            .detail(format!("novel {}: {}", novel_id, e)),
                    );
                    self.cache.invalidate_novel(novel_id);
                    return;
                }
            }
        }
    }

    async fn claim(&self, novel_id: i64) -> AppResult<Option<Novel>> {
        if !self.novels.begin_parse(novel_id).await? {
            return Ok(None);
        }
        self.novels.get(novel_id).await
    }

    async fn attempt(&self, novel: &Novel) -> AppResult<i64> {
        let kind = novel
            .blob_path
            .rsplit_once('.')
            .and_then(|(_, ext)| FileKind::from_extension(ext))
            .ok_or_else(|| AppError::Internal(format!("unknown blob type {}", novel.blob_path)))?;

        let bytes = self.blobs.read(&novel.blob_path).await?;
        let parser = Arc::clone(&self.parser);
        let chapters = tokio::task::spawn_blocking(move || parser.parse(&bytes, kind))
            .await
            .map_err(|e| AppError::Internal(format!("parse task panicked: {}", e)))??;

        self.novels.store_chapters(novel.id, &chapters).await
    }
}
