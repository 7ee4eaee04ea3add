//! Review state machine over novels and user-generated content.
//!
//! Transitions run as guarded UPDATEs with the audit row on the same
//! transaction; cache invalidation and blob cleanup follow the commit.

pub mod catalog;
pub mod repository;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobArea;
use crate::cache::{Cache, RECOMMEND_TAG};
use crate::envelope::{Page, PageQuery};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::ingest::{release_blob, ParseQueue};
use crate::novels::{DynNovelRepository, NovelDetail, NovelStatus};

pub use catalog::{AdminCatalog, CriterionInput};
pub use repository::{
    ContentKind, DynReviewRepository, LogFilter, ReviewRepository, SqliteReviewRepository,
    TargetKind, Transition, SYSTEM_ACTOR,
};

/// Upper bound on ids accepted by one batch approval.
pub const MAX_BATCH: usize = 500;
const MAX_REASON_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub approved_count: usize,
    pub approved_ids: Vec<i64>,
}

fn require_reason(reason: &str) -> AppResult<&str> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::Validation("a reason is required".into()));
    }
    if reason.chars().count() > MAX_REASON_CHARS {
        return Err(AppError::Validation(format!(
            "reason must be at most {} characters",
            MAX_REASON_CHARS
        )));
    }
    Ok(reason)
}

#[derive(Clone)]
pub struct ReviewService {
    repo: DynReviewRepository,
    novels: DynNovelRepository,
    blobs: BlobArea,
    cache: Cache,
    queue: ParseQueue,
    expire_after: Duration,
}

impl ReviewService {
    pub fn new(
        repo: DynReviewRepository,
        novels: DynNovelRepository,
        blobs: BlobArea,
        cache: Cache,
        queue: ParseQueue,
        expire_after: Duration,
    ) -> Self {
        Self {
            repo,
            novels,
            blobs,
            cache,
            queue,
            expire_after,
        }
    }

    pub async fn list_pending(&self, page: PageQuery) -> AppResult<Page<NovelDetail>> {
        let page = page.normalized();
        let (items, total) = self.repo.list_pending(page.page, page.limit).await?;
        Ok(Page {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    pub async fn approve(&self, admin: &CurrentUser, novel_id: i64) -> AppResult<Transition> {
        let outcome = self
            .repo
            .transition(admin.id, novel_id, NovelStatus::Approved, "approve_novel", "")
            .await?;
        if outcome == Transition::Applied {
            tracing::info!(novel_id, admin_id = admin.id, "novel approved");
            self.cache.invalidate_novel(novel_id);
            self.cache.invalidate_tag(RECOMMEND_TAG);
        }
        Ok(outcome)
    }

    pub async fn reject(
        &self,
        admin: &CurrentUser,
        novel_id: i64,
        reason: &str,
    ) -> AppResult<Transition> {
        let reason = require_reason(reason)?;
        let outcome = self
            .repo
            .transition(admin.id, novel_id, NovelStatus::Rejected, "reject_novel", reason)
            .await?;
        if outcome == Transition::Applied {
            tracing::info!(novel_id, admin_id = admin.id, "novel rejected");
            self.cache.invalidate_novel(novel_id);
        }
        Ok(outcome)
    }

    /// Unknown ids and novels that are not pending are skipped silently.
    pub async fn batch_approve(&self, admin: &CurrentUser, ids: &[i64]) -> AppResult<BatchOutcome> {
        if ids.is_empty() {
            return Err(AppError::Validation("ids must not be empty".into()));
        }
        if ids.len() > MAX_BATCH {
            return Err(AppError::Validation(format!(
                "at most {} ids per batch",
                MAX_BATCH
            )));
        }
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let approved = self.repo.batch_approve(admin.id, &unique).await?;
        if !approved.is_empty() {
            tracing::info!(count = approved.len(), admin_id = admin.id, "novels batch approved");
            self.cache.invalidate_novels(&approved);
            self.cache.invalidate_tag(RECOMMEND_TAG);
        }
        Ok(BatchOutcome {
            approved_count: approved.len(),
            approved_ids: approved,
        })
    }

    pub async fn delete_content(
        &self,
        admin: &CurrentUser,
        kind: ContentKind,
        id: i64,
        reason: &str,
    ) -> AppResult<Transition> {
        let reason = require_reason(reason)?;
        let (outcome, novel_id) = self.repo.delete_content(admin.id, kind, id, reason).await?;
        if outcome == Transition::Applied {
            tracing::info!(id, kind = ?kind, admin_id = admin.id, "content deleted");
            if let (ContentKind::Novel, Some(novel_id)) = (kind, novel_id) {
                self.cache.invalidate_novel(novel_id);
                self.cache.invalidate_tag(RECOMMEND_TAG);
                self.release_blob(novel_id).await;
            }
        }
        Ok(outcome)
    }

    /// Remove a tombstoned novel's file unless another live novel shares it.
    async fn release_blob(&self, novel_id: i64) {
        match self.novels.get(novel_id).await {
            Ok(Some(novel)) if novel.is_deleted() => {
                release_blob(&self.novels, &self.blobs, &novel.blob_path, novel_id).await
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(novel_id, error = %e, "could not load novel for blob cleanup"),
        }
    }

    pub async fn set_user_frozen(
        &self,
        admin: &CurrentUser,
        user_id: i64,
        frozen: bool,
    ) -> AppResult<Transition> {
        if frozen && user_id == admin.id {
            return Err(AppError::Validation("administrators cannot freeze themselves".into()));
        }
        let outcome = self.repo.set_user_active(admin.id, user_id, !frozen).await?;
        if outcome == Transition::Applied {
            tracing::info!(user_id, frozen, admin_id = admin.id, "user active flag changed");
        }
        Ok(outcome)
    }

    /// Expire novels pending for longer than the configured age.
    /// Running it again at the same instant changes nothing.
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let cutoff = now - self.expire_after;
        let expired = self.repo.expire_pending(cutoff).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale pending novels");
            self.cache.invalidate_novels(&expired);
            self.cache.invalidate_tag(RECOMMEND_TAG);
        }
        Ok(expired.len())
    }

    pub async fn reparse(&self, admin: &CurrentUser, novel_id: i64) -> AppResult<()> {
        self.repo.reset_for_reparse(admin.id, novel_id).await?;
        self.cache.invalidate_novel(novel_id);
        if let Err(e) = self.queue.try_enqueue(novel_id) {
            tracing::warn!(novel_id, error = %e, "reparse not scheduled, will retry on restart");
        }
        Ok(())
    }

    pub async fn logs(
        &self,
        filter: LogFilter,
        page: PageQuery,
    ) -> AppResult<Page<crate::db::models::AdminLog>> {
        let page = page.normalized();
        let (items, total) = self.repo.logs(&filter, page.page, page.limit).await?;
        Ok(Page {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }
}

/// Run [`ReviewService::sweep`] periodically until shutdown.
pub fn spawn_sweeper(
    service: ReviewService,
    every: std::time::Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(?every, "expiry sweeper started");
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = service.sweep(Utc::now()).await {
                        tracing::warn!(error = %e, "expiry sweep failed");
                    }
                }
            }
        }
        tracing::info!("expiry sweeper stopped");
    })
}
