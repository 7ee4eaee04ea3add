use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// What a reader can like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeTarget {
    Comment,
    Rating,
}

impl LikeTarget {
    fn table(self) -> &'static str {
        match self {
            LikeTarget::Comment => "comments",
            LikeTarget::Rating => "ratings",
        }
    }

    fn like_table(self) -> &'static str {
        match self {
            LikeTarget::Comment => "comment_likes",
            LikeTarget::Rating => "rating_likes",
        }
    }

    fn key(self) -> &'static str {
        match self {
            LikeTarget::Comment => "comment_id",
            LikeTarget::Rating => "rating_id",
        }
    }

    fn label(self) -> &'static str {
        match self {
            LikeTarget::Comment => "Comment",
            LikeTarget::Rating => "Rating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub liked: bool,
    pub like_count: i64,
}

/// The novel a visible comment or rating belongs to.
pub fn target_novel(conn: &Connection, target: LikeTarget, id: i64) -> AppResult<i64> {
    conn.query_row(
        &format!(
            "SELECT novel_id FROM {} WHERE id = ?1 AND deleted_at IS NULL AND is_approved = 1",
            target.table()
        ),
        params![id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(target.label().into()))
}

/// Liking twice, or unliking something never liked, changes nothing.
pub fn set(
    conn: &Connection,
    target: LikeTarget,
    user_id: i64,
    id: i64,
    liked: bool,
) -> AppResult<LikeState> {
    let sql = if liked {
        format!(
            "INSERT OR IGNORE INTO {} (user_id, {}) VALUES (?1, ?2)",
            target.like_table(),
            target.key()
        )
    } else {
        format!(
            "DELETE FROM {} WHERE user_id = ?1 AND {} = ?2",
            target.like_table(),
            target.key()
        )
    };
    conn.execute(&sql, params![user_id, id])?;

    let like_count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            target.like_table(),
            target.key()
        ),
        params![id],
        |r| r.get(0),
    )?;
    Ok(LikeState { liked, like_count })
}
