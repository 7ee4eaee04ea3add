use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::{AppError, AppResult};

pub const MAX_RATING_COMMENT_CHARS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct RatingInput {
    pub score: f64,
    #[serde(default)]
    pub comment: Option<String>,
}

impl RatingInput {
    /// Validated score rounded to one decimal, and the trimmed comment.
    pub fn normalized(&self) -> AppResult<(f64, Option<String>)> {
        if !self.score.is_finite() || !(0.0..=10.0).contains(&self.score) {
            return Err(AppError::Validation("score must be between 0 and 10".into()));
        }
        let score = (self.score * 10.0).round() / 10.0;
        let comment = match self.comment.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) if text.chars().count() > MAX_RATING_COMMENT_CHARS => {
                return Err(AppError::Validation(format!(
                    "comment must be at most {} characters",
                    MAX_RATING_COMMENT_CHARS
                )))
            }
            Some(text) => Some(text.to_string()),
        };
        Ok((score, comment))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: i64,
    pub novel_id: i64,
    pub user_id: i64,
    pub nickname: String,
    pub score: f64,
    pub comment: Option<String>,
    pub like_count: i64,
    pub created_at: String,
}

impl Rating {
    const SELECT: &'static str = "SELECT r.id, r.novel_id, r.user_id, COALESCE(u.nickname, ''), \
         r.score, r.comment, \
         (SELECT COUNT(*) FROM rating_likes l WHERE l.rating_id = r.id), \
         r.created_at FROM ratings r LEFT JOIN users u ON u.id = r.user_id";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            novel_id: row.get(1)?,
            user_id: row.get(2)?,
            nickname: row.get(3)?,
            score: row.get(4)?,
            comment: row.get(5)?,
            like_count: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingSummary {
    pub average: f64,
    pub count: i64,
    pub items: Vec<Rating>,
}

/// The unique (user, novel) index turns a second rating into a conflict.
pub fn insert(
    conn: &Connection,
    novel_id: i64,
    user_id: i64,
    score: f64,
    comment: Option<&str>,
) -> AppResult<Rating> {
    let inserted = conn.execute(
        "INSERT INTO ratings (novel_id, user_id, score, comment) VALUES (?1, ?2, ?3, ?4)",
        params![novel_id, user_id, score, comment],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(AppError::StateConflict("novel already rated".into()))
        }
        Err(e) => return Err(e.into()),
    }
    let id = conn.last_insert_rowid();
    let rating = conn.query_row(
        &format!("{} WHERE r.id = ?1", Rating::SELECT),
        params![id],
        Rating::from_row,
    )?;
    Ok(rating)
}

/// Average and count over approved, live ratings, plus one page of them.
pub fn summary(conn: &Connection, novel_id: i64, page: u32, limit: u32) -> AppResult<RatingSummary> {
    const VISIBLE: &str = "r.novel_id = ?1 AND r.deleted_at IS NULL AND r.is_approved = 1";

    let (average, count): (Option<f64>, i64) = conn.query_row(
        &format!("SELECT AVG(r.score), COUNT(*) FROM ratings r WHERE {}", VISIBLE),
        params![novel_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let (limit, offset) = db::page_window(page, limit);
    let mut stmt = conn.prepare(&format!(
        "{} WHERE {} ORDER BY r.created_at DESC, r.id DESC LIMIT ?2 OFFSET ?3",
        Rating::SELECT,
        VISIBLE
    ))?;
    let items = stmt
        .query_map(params![novel_id, limit, offset], Rating::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RatingSummary {
        average: average.map(|a| (a * 10.0).round() / 10.0).unwrap_or(0.0),
        count,
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_are_bounded_and_rounded() {
        let input = |score: f64| RatingInput { score, comment: None };
        assert_eq!(input(7.25).normalized().unwrap().0, 7.3);
        assert_eq!(input(10.0).normalized().unwrap().0, 10.0);
        assert!(input(10.01).normalized().is_err());
        assert!(input(-0.5).normalized().is_err());
        assert!(input(f64::NAN).normalized().is_err());
    }

    #[test]
    fn comments_are_trimmed_and_limited() {
        let with = |comment: &str| RatingInput {
            score: 5.0,
            comment: Some(comment.to_string()),
        };
        assert_eq!(with("  好看 ").normalized().unwrap().1.as_deref(), Some("好看"));
        assert_eq!(with("   ").normalized().unwrap().1, None);
        assert!(with(&"字".repeat(MAX_RATING_COMMENT_CHARS + 1)).normalized().is_err());
    }
}
