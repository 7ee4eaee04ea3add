// Repository pattern - every admin mutation and its audit row share one transaction
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{self, models::AdminLog};
use crate::error::{AppError, AppResult};
use crate::novels::repository::{find_novel, load_details};
use crate::novels::{NovelDetail, NovelStatus};
use crate::state::DbPool;

/// Actor id recorded for automatic actions.
pub const SYSTEM_ACTOR: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Novel,
    User,
    Comment,
    Rating,
    System,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Novel => "novel",
            TargetKind::User => "user",
            TargetKind::Comment => "comment",
            TargetKind::Rating => "rating",
            TargetKind::System => "system",
        }
    }
}

/// Content an administrator can tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Novel,
    Comment,
    Rating,
}

impl ContentKind {
    fn table(self) -> &'static str {
        match self {
            ContentKind::Novel => "novels",
            ContentKind::Comment => "comments",
            ContentKind::Rating => "ratings",
        }
    }

    fn target(self) -> TargetKind {
        match self {
            ContentKind::Novel => TargetKind::Novel,
            ContentKind::Comment => TargetKind::Comment,
            ContentKind::Rating => TargetKind::Rating,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ContentKind::Novel => "Novel",
            ContentKind::Comment => "Comment",
            ContentKind::Rating => "Rating",
        }
    }
}

/// Result of a guarded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Applied,
    /// The target was already in the requested state; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub admin_id: Option<i64>,
    pub action: Option<String>,
}

/// Append one audit row on the caller's transaction.
pub fn log_action(
    conn: &Connection,
    admin_id: i64,
    action: &str,
    target: TargetKind,
    target_id: i64,
    detail: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO admin_logs (admin_id, action, target_kind, target_id, detail)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![admin_id, action, target.as_str(), target_id, detail],
    )?;
    Ok(())
}

#[async_trait]
pub trait ReviewRepository: Send + Sync {
    async fn list_pending(&self, page: u32, limit: u32) -> AppResult<(Vec<NovelDetail>, i64)>;

    /// Move a pending novel to `target`, logging `action` with `detail`.
    async fn transition(
        &self,
        admin_id: i64,
        novel_id: i64,
        target: NovelStatus,
        action: &str,
        detail: &str,
    ) -> AppResult<Transition>;

    /// Approve every pending novel among `ids`. Returns the ids that moved.
    async fn batch_approve(&self, admin_id: i64, ids: &[i64]) -> AppResult<Vec<i64>>;

    /// Tombstone content. Returns the novel id whose views must be refreshed.
    async fn delete_content(
        &self,
        admin_id: i64,
        kind: ContentKind,
        id: i64,
        reason: &str,
    ) -> AppResult<(Transition, Option<i64>)>;

    async fn set_user_active(&self, admin_id: i64, user_id: i64, active: bool)
        -> AppResult<Transition>;

    /// Expire novels pending since before `cutoff`, with one system log row.
    async fn expire_pending(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<i64>>;

    /// Drop chapters and mark the novel unparsed.
    async fn reset_for_reparse(&self, admin_id: i64, novel_id: i64) -> AppResult<()>;

    async fn logs(&self, filter: &LogFilter, page: u32, limit: u32)
        -> AppResult<(Vec<AdminLog>, i64)>;
}

pub struct SqliteReviewRepository {
    pool: DbPool,
}

impl SqliteReviewRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReviewRepository for SqliteReviewRepository {
    async fn list_pending(&self, page: u32, limit: u32) -> AppResult<(Vec<NovelDetail>, i64)> {
        let conn = self.pool.get()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM novels WHERE status = 'pending' AND deleted_at IS NULL",
            [],
            |r| r.get(0),
        )?;

        let (limit, offset) = db::page_window(page, limit);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM novels WHERE status = 'pending' AND deleted_at IS NULL
             ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            crate::novels::Novel::COLUMNS
        ))?;
        let novels = stmt
            .query_map(params![limit, offset], crate::novels::Novel::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((load_details(&conn, novels)?, total))
    }

    async fn transition(
        &self,
        admin_id: i64,
        novel_id: i64,
        target: NovelStatus,
        action: &str,
        detail: &str,
    ) -> AppResult<Transition> {
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            let rows = conn.execute(
                "UPDATE novels SET status = ?2, updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'pending' AND deleted_at IS NULL",
                params![novel_id, target],
            )?;
            if rows == 1 {
                log_action(conn, admin_id, action, TargetKind::Novel, novel_id, detail)?;
                return Ok(Transition::Applied);
            }

            match find_novel(conn, novel_id)? {
                Some(novel) if !novel.is_deleted() => {
                    if novel.status == target {
                        Ok(Transition::Unchanged)
                    } else {
                        Err(AppError::StateConflict(format!(
                            "novel {} is {}",
                            novel_id, novel.status
                        )))
                    }
                }
                _ => Err(AppError::NotFound("Novel".into())),
            }
        })
    }

    async fn batch_approve(&self, admin_id: i64, ids: &[i64]) -> AppResult<Vec<i64>> {
        let conn = self.pool.get()?;
        let placeholders = vec!["?"; ids.len()].join(", ");

        db::immediate_transaction(&conn, |conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE novels SET status = 'approved', updated_at = datetime('now')
                 WHERE id IN ({}) AND status = 'pending' AND deleted_at IS NULL
                 RETURNING id",
                placeholders
            ))?;
            let mut approved = stmt
                .query_map(params_from_iter(ids.iter()), |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            approved.sort_unstable();

            if !approved.is_empty() {
                let listed: Vec<String> = approved.iter().map(|id| id.to_string()).collect();
                log_action(
                    conn,
                    admin_id,
                    "batch_approve_novels",
                    TargetKind::Novel,
                    0,
                    &format!(
                        "batch approved {} novels: {}",
                        approved.len(),
                        listed.join(",")
                    ),
                )?;
            }
            Ok(approved)
        })
    }

    async fn delete_content(
        &self,
        admin_id: i64,
        kind: ContentKind,
        id: i64,
        reason: &str,
    ) -> AppResult<(Transition, Option<i64>)> {
        let conn = self.pool.get()?;
        let table = kind.table();

        db::immediate_transaction(&conn, |conn| {
            let owner: Option<(Option<i64>, bool)> = conn
                .query_row(
                    &match kind {
                        ContentKind::Novel => {
                            "SELECT id, deleted_at IS NOT NULL FROM novels WHERE id = ?1".to_string()
                        }
                        _ => format!(
                            "SELECT novel_id, deleted_at IS NOT NULL FROM {} WHERE id = ?1",
                            table
                        ),
                    },
                    params![id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let (novel_id, already_deleted) =
                owner.ok_or_else(|| AppError::NotFound(kind.label().into()))?;
            if already_deleted {
                return Ok((Transition::Unchanged, None));
            }

            conn.execute(
                &format!(
                    "UPDATE {} SET deleted_at = datetime('now'), updated_at = datetime('now')
                     WHERE id = ?1 AND deleted_at IS NULL",
                    table
                ),
                params![id],
            )?;
            log_action(
                conn,
                admin_id,
                &format!("delete_{}", kind.target().as_str()),
                kind.target(),
                id,
                reason,
            )?;

            Ok((Transition::Applied, novel_id))
        })
    }

    async fn set_user_active(
        &self,
        admin_id: i64,
        user_id: i64,
        active: bool,
    ) -> AppResult<Transition> {
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            let current: Option<bool> = conn
                .query_row(
                    "SELECT is_active FROM users WHERE id = ?1",
                    params![user_id],
                    |r| r.get(0),
                )
                .optional()?;
            match current {
                None => return Err(AppError::NotFound("User".into())),
                Some(current) if current == active => return Ok(Transition::Unchanged),
                Some(_) => {}
            }

            conn.execute(
                "UPDATE users SET is_active = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![user_id, active],
            )?;
            let action = if active { "unfreeze_user" } else { "freeze_user" };
            log_action(conn, admin_id, action, TargetKind::User, user_id, "")?;
            Ok(Transition::Applied)
        })
    }

    async fn expire_pending(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            let mut stmt = conn.prepare(
                "UPDATE novels SET status = 'expired', updated_at = datetime('now')
                 WHERE status = 'pending' AND deleted_at IS NULL AND created_at < ?1
                 RETURNING id",
            )?;
            let mut expired = stmt
                .query_map(params![db::timestamp(cutoff)], |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            expired.sort_unstable();

            if !expired.is_empty() {
                log_action(
                    conn,
                    SYSTEM_ACTOR,
                    "expire_novels",
                    TargetKind::Novel,
                    0,
                    &format!("expired {} novels pending since before {}", expired.len(), db::timestamp(cutoff)),
                )?;
            }
            Ok(expired)
        })
    }

    async fn reset_for_reparse(&self, admin_id: i64, novel_id: i64) -> AppResult<()> {
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            match find_novel(conn, novel_id)? {
                Some(novel) if !novel.is_deleted() => {}
                _ => return Err(AppError::NotFound("Novel".into())),
            }
            conn.execute("DELETE FROM chapters WHERE novel_id = ?1", params![novel_id])?;
            conn.execute(
                "UPDATE novels SET parsing_status = 'unparsed', word_count = 0,
                                   updated_at = datetime('now')
                 WHERE id = ?1",
                params![novel_id],
            )?;
            log_action(conn, admin_id, "reparse_novel", TargetKind::Novel, novel_id, "")?;
            Ok(())
        })
    }

    async fn logs(
        &self,
        filter: &LogFilter,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<AdminLog>, i64)> {
        let conn = self.pool.get()?;
        let action = filter.action.as_deref().map(crate::novels::repository::like_pattern);
        let where_clause = "(?1 IS NULL OR admin_id = ?1) AND (?2 IS NULL OR action LIKE ?2 ESCAPE '\\')";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM admin_logs WHERE {}", where_clause),
            params![filter.admin_id, action],
            |r| r.get(0),
        )?;

        let (limit, offset) = db::page_window(page, limit);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM admin_logs WHERE {} ORDER BY id DESC LIMIT ?3 OFFSET ?4",
            AdminLog::COLUMNS,
            where_clause
        ))?;
        let items = stmt
            .query_map(
                params![filter.admin_id, action, limit, offset],
                AdminLog::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((items, total))
    }
}

/// Type alias for Arc-wrapped repository (for AppState)
pub type DynReviewRepository = Arc<dyn ReviewRepository>;
