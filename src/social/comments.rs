use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::{AppError, AppResult};

pub const MAX_COMMENT_CHARS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct CommentInput {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

impl CommentInput {
    pub fn content(&self) -> AppResult<&str> {
        let content = self.content.trim();
        if content.is_empty() || content.chars().count() > MAX_COMMENT_CHARS {
            return Err(AppError::Validation(format!(
                "content must be 1 to {} characters",
                MAX_COMMENT_CHARS
            )));
        }
        Ok(content)
    }
}

/// A top-level comment carries every descendant in `replies`, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub novel_id: i64,
    pub user_id: i64,
    pub nickname: String,
    pub parent_id: Option<i64>,
    pub content: String,
    pub like_count: i64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Comment>,
}

impl Comment {
    const SELECT: &'static str = "SELECT c.id, c.novel_id, c.user_id, COALESCE(u.nickname, ''), \
         c.parent_id, c.content, \
         (SELECT COUNT(*) FROM comment_likes l WHERE l.comment_id = c.id), \
         c.created_at FROM comments c LEFT JOIN users u ON u.id = c.user_id";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            novel_id: row.get(1)?,
            user_id: row.get(2)?,
            nickname: row.get(3)?,
            parent_id: row.get(4)?,
            content: row.get(5)?,
            like_count: row.get(6)?,
            created_at: row.get(7)?,
            replies: Vec::new(),
        })
    }
}

const VISIBLE: &str = "c.deleted_at IS NULL AND c.is_approved = 1";

/// The parent, when given, must be a live comment on the same novel.
pub fn insert(
    conn: &Connection,
    novel_id: i64,
    user_id: i64,
    content: &str,
    parent_id: Option<i64>,
) -> AppResult<Comment> {
    if let Some(parent) = parent_id {
        let parent_novel: Option<i64> = conn
            .query_row(
                "SELECT novel_id FROM comments WHERE id = ?1 AND deleted_at IS NULL",
                params![parent],
                |r| r.get(0),
            )
            .optional()?;
        if parent_novel != Some(novel_id) {
            return Err(AppError::Validation(
                "parent comment does not belong to this novel".into(),
            ));
        }
    }

    conn.execute(
        "INSERT INTO comments (novel_id, user_id, parent_id, content) VALUES (?1, ?2, ?3, ?4)",
        params![novel_id, user_id, parent_id, content],
    )?;
    let id = conn.last_insert_rowid();
    let comment = conn.query_row(
        &format!("{} WHERE c.id = ?1", Comment::SELECT),
        params![id],
        Comment::from_row,
    )?;
    Ok(comment)
}

/// One page of top-level comments, newest first, each with its replies.
pub fn thread_page(
    conn: &Connection,
    novel_id: i64,
    page: u32,
    limit: u32,
) -> AppResult<(Vec<Comment>, i64)> {
    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM comments c WHERE c.novel_id = ?1 AND c.parent_id IS NULL AND {}",
            VISIBLE
        ),
        params![novel_id],
        |r| r.get(0),
    )?;

    let (limit, offset) = db::page_window(page, limit);
    let mut stmt = conn.prepare(&format!(
        "{} WHERE c.novel_id = ?1 AND c.parent_id IS NULL AND {}
         ORDER BY c.created_at DESC, c.id DESC LIMIT ?2 OFFSET ?3",
        Comment::SELECT,
        VISIBLE
    ))?;
    let mut roots = stmt
        .query_map(params![novel_id, limit, offset], Comment::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut replies_stmt = conn.prepare_cached(&format!(
        "WITH RECURSIVE thread(id) AS (
             SELECT id FROM comments WHERE parent_id = ?1
             UNION ALL
             SELECT child.id FROM comments child JOIN thread t ON child.parent_id = t.id
         )
         {} WHERE c.id IN (SELECT id FROM thread) AND {}
         ORDER BY c.created_at ASC, c.id ASC",
        Comment::SELECT,
        VISIBLE
    ))?;
    for root in &mut roots {
        root.replies = replies_stmt
            .query_map(params![root.id], Comment::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok((roots, total))
}
