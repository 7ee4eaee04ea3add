use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressInput {
    #[serde(default)]
    pub chapter_id: Option<i64>,
    #[serde(default)]
    pub chapter_name: String,
    #[serde(default)]
    pub position: i64,
    /// Percent of the novel read, 0 to 100.
    #[serde(default)]
    pub progress: f64,
    /// Seconds read since the last report; added to the running total.
    #[serde(default)]
    pub reading_seconds: i64,
}

impl ProgressInput {
    pub fn validate(&self) -> AppResult<()> {
        if !self.progress.is_finite() || !(0.0..=100.0).contains(&self.progress) {
            return Err(AppError::Validation("progress must be between 0 and 100".into()));
        }
        if self.position < 0 || self.reading_seconds < 0 {
            return Err(AppError::Validation(
                "position and reading_seconds must not be negative".into(),
            ));
        }
        if self.chapter_name.chars().count() > 200 {
            return Err(AppError::Validation("chapter_name is too long".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub novel_id: i64,
    pub chapter_id: Option<i64>,
    pub chapter_name: String,
    pub position: i64,
    pub progress: f64,
    pub reading_seconds: i64,
    pub last_read_at: String,
}

impl ReadingProgress {
    const COLUMNS: &'static str =
        "novel_id, chapter_id, chapter_name, position, progress, reading_seconds, last_read_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            novel_id: row.get(0)?,
            chapter_id: row.get(1)?,
            chapter_name: row.get(2)?,
            position: row.get(3)?,
            progress: row.get(4)?,
            reading_seconds: row.get(5)?,
            last_read_at: row.get(6)?,
        })
    }
}

/// One line of a reader's history: where they are in which novel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub progress: ReadingProgress,
    pub title: String,
    pub author: String,
}

pub fn upsert(
    conn: &Connection,
    user_id: i64,
    novel_id: i64,
    input: &ProgressInput,
) -> AppResult<ReadingProgress> {
    let saved = conn.query_row(
        &format!(
            "INSERT INTO reading_progress
                 (user_id, novel_id, chapter_id, chapter_name, position, progress, reading_seconds, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
             ON CONFLICT(user_id, novel_id) DO UPDATE SET
                 chapter_id = excluded.chapter_id,
                 chapter_name = excluded.chapter_name,
                 position = excluded.position,
                 progress = excluded.progress,
                 reading_seconds = reading_progress.reading_seconds + excluded.reading_seconds,
                 last_read_at = excluded.last_read_at
             RETURNING {}",
            ReadingProgress::COLUMNS
        ),
        params![
            user_id,
            novel_id,
            input.chapter_id,
            input.chapter_name.trim(),
            input.position,
            input.progress,
            input.reading_seconds
        ],
        ReadingProgress::from_row,
    )?;
    Ok(saved)
}

pub fn find(conn: &Connection, user_id: i64, novel_id: i64) -> AppResult<Option<ReadingProgress>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {} FROM reading_progress WHERE user_id = ?1 AND novel_id = ?2",
                ReadingProgress::COLUMNS
            ),
            params![user_id, novel_id],
            ReadingProgress::from_row,
        )
        .optional()?;
    Ok(found)
}

/// Most recently read first. Deleted novels drop out.
pub fn history(
    conn: &Connection,
    user_id: i64,
    page: u32,
    limit: u32,
) -> AppResult<(Vec<HistoryEntry>, i64)> {
    const JOINED: &str = "reading_progress rp JOIN novels n ON n.id = rp.novel_id
         WHERE rp.user_id = ?1 AND n.deleted_at IS NULL";

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", JOINED),
        params![user_id],
        |r| r.get(0),
    )?;

    let (limit, offset) = db::page_window(page, limit);
    let mut stmt = conn.prepare(&format!(
        "SELECT rp.novel_id, rp.chapter_id, rp.chapter_name, rp.position, rp.progress,
                rp.reading_seconds, rp.last_read_at, n.title, n.author
         FROM {} ORDER BY rp.last_read_at DESC, rp.id DESC LIMIT ?2 OFFSET ?3",
        JOINED
    ))?;
    let items = stmt
        .query_map(params![user_id, limit, offset], |row| {
            Ok(HistoryEntry {
                progress: ReadingProgress::from_row(row)?,
                title: row.get(7)?,
                author: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items, total))
}
