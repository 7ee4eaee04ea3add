// Repository pattern - isolates all database side effects for novels
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;

use super::domain::*;
use crate::db::{self, models::Category, models::NamedRef};
use crate::error::{AppError, AppResult};
use crate::parser::ParsedChapter;
use crate::state::DbPool;

#[async_trait]
pub trait NovelRepository: Send + Sync {
    /// A non-rejected, non-deleted novel with this content hash.
    async fn find_live_by_hash(&self, hash: &str) -> AppResult<Option<Novel>>;

    /// Insert the novel and its associations in one transaction.
    async fn insert(&self, novel: &NewNovel) -> AppResult<i64>;

    /// Any novel row, tombstoned ones included.
    async fn get(&self, id: i64) -> AppResult<Option<Novel>>;

    async fn detail(&self, id: i64) -> AppResult<Option<NovelDetail>>;

    async fn list_approved(
        &self,
        filter: &NovelFilter,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<NovelDetail>, i64)>;

    async fn list_by_uploader(
        &self,
        uploader_id: i64,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<NovelDetail>, i64)>;

    async fn count_uploads_since(&self, uploader_id: i64, since: DateTime<Utc>) -> AppResult<i64>;

    /// Claim a novel for parsing. False when it is gone or already parsed.
    async fn begin_parse(&self, id: i64) -> AppResult<bool>;

    async fn mark_parse_failed(&self, id: i64) -> AppResult<()>;

    /// Replace the novel's chapters and flip it to `parsed` atomically.
    /// Returns the total word count.
    async fn store_chapters(&self, id: i64, chapters: &[ParsedChapter]) -> AppResult<i64>;

    /// Novels whose parse never finished.
    async fn unfinished_parse_ids(&self) -> AppResult<Vec<i64>>;

    async fn chapter_headers(&self, novel_id: i64) -> AppResult<Vec<ChapterHeader>>;

    async fn chapter(&self, chapter_id: i64) -> AppResult<Option<ChapterBody>>;

    /// Tombstone a novel. False when it was already deleted or never existed.
    async fn soft_delete(&self, id: i64) -> AppResult<bool>;

    /// Whether a live novel other than `except_id` still points at this blob.
    async fn blob_in_use(&self, blob_path: &str, except_id: i64) -> AppResult<bool>;

    async fn categories(&self) -> AppResult<Vec<Category>>;

    /// Approved, live novels ordered by the counter for `kind`, ties by id.
    async fn rankings(
        &self,
        kind: RankingKind,
        category_id: Option<i64>,
        limit: u32,
    ) -> AppResult<Vec<NovelDetail>>;

    /// Count one search for `keyword`.
    async fn record_search(&self, keyword: &str) -> AppResult<()>;

    /// Most searched keywords; the most used novel keywords until anything
    /// has been searched.
    async fn hot_keywords(&self, limit: u32) -> AppResult<Vec<String>>;

    /// Matching titles first, then matching past searches, without repeats.
    async fn suggestions(&self, keyword: &str, limit: u32) -> AppResult<Vec<Suggestion>>;
}

pub struct SqliteNovelRepository {
    pool: DbPool,
}

impl SqliteNovelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` substring match.
pub fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

pub fn find_novel(conn: &Connection, id: i64) -> AppResult<Option<Novel>> {
    let novel = conn
        .query_row(
            &format!("SELECT {} FROM novels WHERE id = ?1", Novel::COLUMNS),
            params![id],
            Novel::from_row,
        )
        .optional()?;
    Ok(novel)
}

/// Load uploader, categories and keywords for each novel.
pub fn load_details(conn: &Connection, novels: Vec<Novel>) -> AppResult<Vec<NovelDetail>> {
    let mut uploader_stmt = conn.prepare_cached("SELECT id, nickname FROM users WHERE id = ?1")?;
    let mut category_stmt = conn.prepare_cached(
        "SELECT c.id, c.name FROM categories c
         JOIN novel_categories nc ON nc.category_id = c.id
         WHERE nc.novel_id = ?1 ORDER BY c.id",
    )?;
    let mut keyword_stmt = conn.prepare_cached(
        "SELECT k.id, k.word FROM keywords k
         JOIN novel_keywords nk ON nk.keyword_id = k.id
         WHERE nk.novel_id = ?1 ORDER BY k.id",
    )?;

    let named = |row: &rusqlite::Row<'_>| -> rusqlite::Result<NamedRef> {
        Ok(NamedRef {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    };

    let mut details = Vec::with_capacity(novels.len());
    for novel in novels {
        let uploader = uploader_stmt
            .query_row(params![novel.uploader_id], named)
            .optional()?
            .unwrap_or(NamedRef {
                id: novel.uploader_id,
                name: String::new(),
            });
        let categories = category_stmt
            .query_map(params![novel.id], named)?
            .collect::<Result<Vec<_>, _>>()?;
        let keywords = keyword_stmt
            .query_map(params![novel.id], named)?
            .collect::<Result<Vec<_>, _>>()?;
        details.push(NovelDetail {
            novel,
            uploader,
            categories,
            keywords,
        });
    }
    Ok(details)
}

fn query_novels(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> AppResult<Vec<Novel>> {
    let mut stmt = conn.prepare(sql)?;
    let novels = stmt
        .query_map(params, Novel::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(novels)
}

/// Novels filed under the category bound to `?slot` or any of its descendants.
fn category_tree_filter(slot: usize) -> String {
    format!(
        "id IN (
            SELECT nc.novel_id FROM novel_categories nc
            WHERE nc.category_id IN (
                WITH RECURSIVE tree(id) AS (
                    SELECT ?{}
                    UNION
                    SELECT c.id FROM categories c JOIN tree t ON c.parent_id = t.id
                )
                SELECT id FROM tree
            )
        )",
        slot
    )
}

const AVERAGE_SCORE: &str = "(SELECT COALESCE(AVG(r.score), 0) FROM ratings r
     WHERE r.novel_id = novels.id AND r.deleted_at IS NULL AND r.is_approved = 1)";

const LIVE_APPROVED: &str = "status = 'approved' AND deleted_at IS NULL";

fn keyword_id(conn: &Connection, word: &str) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO keywords (word) VALUES (?1) ON CONFLICT(word) DO NOTHING",
        params![word],
    )?;
    let id = conn.query_row(
        "SELECT id FROM keywords WHERE word = ?1",
        params![word],
        |r| r.get(0),
    )?;
    Ok(id)
}

#[async_trait]
impl NovelRepository for SqliteNovelRepository {
    async fn find_live_by_hash(&self, hash: &str) -> AppResult<Option<Novel>> {
        let conn = self.pool.get()?;
        let novel = conn
            .query_row(
                &format!(
                    "SELECT {} FROM novels
                     WHERE content_hash = ?1 AND status != 'rejected' AND deleted_at IS NULL",
                    Novel::COLUMNS
                ),
                params![hash],
                Novel::from_row,
            )
            .optional()?;
        Ok(novel)
    }

    async fn insert(&self, novel: &NewNovel) -> AppResult<i64> {
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            for category_id in &novel.category_ids {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1)",
                    params![category_id],
                    |r| r.get(0),
                )?;
                if !exists {
                    return Err(AppError::Validation(format!(
                        "unknown category {}",
                        category_id
                    )));
                }
            }

            let inserted = conn.execute(
                "INSERT INTO novels (title, author, protagonist, description, blob_path,
                                     file_size, content_hash, uploader_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    novel.title,
                    novel.author,
                    novel.protagonist,
                    novel.description,
                    novel.blob_path,
                    novel.file_size,
                    novel.content_hash,
                    novel.uploader_id
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if db::is_unique_violation(&e) => {
                    return Err(AppError::StateConflict("novel already uploaded".into()))
                }
                Err(e) => return Err(e.into()),
            }
            let id = conn.last_insert_rowid();

            for category_id in &novel.category_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO novel_categories (novel_id, category_id) VALUES (?1, ?2)",
                    params![id, category_id],
                )?;
            }
            for word in &novel.keywords {
                let keyword = keyword_id(conn, word)?;
                conn.execute(
                    "INSERT OR IGNORE INTO novel_keywords (novel_id, keyword_id) VALUES (?1, ?2)",
                    params![id, keyword],
                )?;
            }

            Ok(id)
        })
    }

    async fn get(&self, id: i64) -> AppResult<Option<Novel>> {
        let conn = self.pool.get()?;
        find_novel(&conn, id)
    }

    async fn detail(&self, id: i64) -> AppResult<Option<NovelDetail>> {
        let conn = self.pool.get()?;
        let Some(novel) = find_novel(&conn, id)? else {
            return Ok(None);
        };
        Ok(load_details(&conn, vec![novel])?.pop())
    }

    async fn list_approved(
        &self,
        filter: &NovelFilter,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<NovelDetail>, i64)> {
        let conn = self.pool.get()?;
        let title = filter.title.as_deref().map(like_pattern);
        let author = filter.author.as_deref().map(like_pattern);
        let keyword = filter.keyword.as_deref().map(like_pattern);
        let where_clause = format!(
            "{live}
             AND (?1 IS NULL OR title LIKE ?1 ESCAPE '\\')
             AND (?2 IS NULL OR author LIKE ?2 ESCAPE '\\')
             AND (?3 IS NULL OR {tree})
             AND (?4 IS NULL OR title LIKE ?4 ESCAPE '\\' OR author LIKE ?4 ESCAPE '\\'
                  OR protagonist LIKE ?4 ESCAPE '\\' OR description LIKE ?4 ESCAPE '\\')
             AND (?5 IS NULL OR {avg} >= ?5)
             AND (?6 IS NULL OR {avg} <= ?6)",
            live = LIVE_APPROVED,
            tree = category_tree_filter(3),
            avg = AVERAGE_SCORE,
        );

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM novels WHERE {}", where_clause),
            params![
                title,
                author,
                filter.category_id,
                keyword,
                filter.min_score,
                filter.max_score
            ],
            |r| r.get(0),
        )?;

        let (limit, offset) = db::page_window(page, limit);
        let novels = query_novels(
            &conn,
            &format!(
                "SELECT {} FROM novels WHERE {}
                 ORDER BY created_at DESC, id DESC LIMIT ?7 OFFSET ?8",
                Novel::COLUMNS,
                where_clause
            ),
            params![
                title,
                author,
                filter.category_id,
                keyword,
                filter.min_score,
                filter.max_score,
                limit,
                offset
            ],
        )?;

        Ok((load_details(&conn, novels)?, total))
    }

    async fn list_by_uploader(
        &self,
        uploader_id: i64,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<NovelDetail>, i64)> {
        let conn = self.pool.get()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM novels WHERE uploader_id = ?1 AND deleted_at IS NULL",
            params![uploader_id],
            |r| r.get(0),
        )?;

        let (limit, offset) = db::page_window(page, limit);
        let novels = query_novels(
            &conn,
            &format!(
                "SELECT {} FROM novels WHERE uploader_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                Novel::COLUMNS
            ),
            params![uploader_id, limit, offset],
        )?;

        Ok((load_details(&conn, novels)?, total))
    }

    async fn count_uploads_since(&self, uploader_id: i64, since: DateTime<Utc>) -> AppResult<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM novels WHERE uploader_id = ?1 AND created_at >= ?2",
            params![uploader_id, db::timestamp(since)],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    async fn begin_parse(&self, id: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let rows = conn.execute(
            "UPDATE novels SET parsing_status = 'parsing', updated_at = datetime('now')
             WHERE id = ?1 AND deleted_at IS NULL AND parsing_status != 'parsed'",
            params![id],
        )?;
        Ok(rows > 0)
    }

    async fn mark_parse_failed(&self, id: i64) -> AppResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE novels SET parsing_status = 'failed', updated_at = datetime('now')
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    async fn store_chapters(&self, id: i64, chapters: &[ParsedChapter]) -> AppResult<i64> {
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            conn.execute("DELETE FROM chapters WHERE novel_id = ?1", params![id])?;

            let mut total: i64 = 0;
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO chapters (novel_id, position, title, body, start_offset,
                                           end_offset, word_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for chapter in chapters {
                    stmt.execute(params![
                        id,
                        chapter.position,
                        chapter.title,
                        chapter.body,
                        chapter.start as i64,
                        chapter.end as i64,
                        chapter.word_count as i64
                    ])?;
                    total += chapter.word_count as i64;
                }
            }

            let rows = conn.execute(
                "UPDATE novels SET parsing_status = 'parsed', word_count = ?2,
                                   updated_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, total],
            )?;
            if rows == 0 {
                return Err(AppError::NotFound("Novel".into()));
            }

            Ok(total)
        })
    }

    async fn unfinished_parse_ids(&self) -> AppResult<Vec<i64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM novels
             WHERE parsing_status IN ('unparsed', 'parsing') AND deleted_at IS NULL
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    async fn chapter_headers(&self, novel_id: i64) -> AppResult<Vec<ChapterHeader>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, position, title, word_count FROM chapters
             WHERE novel_id = ?1 ORDER BY position",
        )?;
        let headers = stmt
            .query_map(params![novel_id], |row| {
                Ok(ChapterHeader {
                    id: row.get(0)?,
                    position: row.get(1)?,
                    title: row.get(2)?,
                    word_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(headers)
    }

    async fn chapter(&self, chapter_id: i64) -> AppResult<Option<ChapterBody>> {
        let conn = self.pool.get()?;
        let found = conn
            .query_row(
                "SELECT id, novel_id, position, title, body, word_count FROM chapters WHERE id = ?1",
                params![chapter_id],
                |row| {
                    Ok(ChapterBody {
                        id: row.get(0)?,
                        novel_id: row.get(1)?,
                        position: row.get(2)?,
                        title: row.get(3)?,
                        body: row.get(4)?,
                        word_count: row.get(5)?,
                        prev_id: None,
                        next_id: None,
                    })
                },
            )
            .optional()?;

        let Some(mut chapter) = found else {
            return Ok(None);
        };

        let neighbor = |position: i64| -> AppResult<Option<i64>> {
            let id = conn
                .query_row(
                    "SELECT id FROM chapters WHERE novel_id = ?1 AND position = ?2",
                    params![chapter.novel_id, position],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(id)
        };
        let prev_id = neighbor(chapter.position - 1)?;
        let next_id = neighbor(chapter.position + 1)?;
        chapter.prev_id = prev_id;
        chapter.next_id = next_id;

        Ok(Some(chapter))
    }

    async fn soft_delete(&self, id: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let rows = conn.execute(
            "UPDATE novels SET deleted_at = datetime('now'), updated_at = datetime('now')
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
        )?;
        Ok(rows > 0)
    }

    async fn blob_in_use(&self, blob_path: &str, except_id: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let in_use = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM novels
                           WHERE blob_path = ?1 AND id != ?2 AND deleted_at IS NULL)",
            params![blob_path, except_id],
            |r| r.get(0),
        )?;
        Ok(in_use)
    }

    async fn categories(&self) -> AppResult<Vec<Category>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id, name, parent_id FROM categories ORDER BY id")?;
        let flat = stmt
            .query_map([], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    parent_id: row.get(2)?,
                    children: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(category_forest(flat))
    }

    async fn rankings(
        &self,
        kind: RankingKind,
        category_id: Option<i64>,
        limit: u32,
    ) -> AppResult<Vec<NovelDetail>> {
        let conn = self.pool.get()?;
        let novels = query_novels(
            &conn,
            &format!(
                "SELECT {} FROM novels WHERE {} AND (?1 IS NULL OR {})
                 ORDER BY {} DESC, id ASC LIMIT ?2",
                Novel::COLUMNS,
                LIVE_APPROVED,
                category_tree_filter(1),
                kind.column()
            ),
            params![category_id, limit],
        )?;
        load_details(&conn, novels)
    }

    async fn record_search(&self, keyword: &str) -> AppResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO search_stats (keyword) VALUES (?1)
             ON CONFLICT(keyword) DO UPDATE SET
                 hits = hits + 1,
                 last_searched_at = datetime('now')",
            params![keyword],
        )?;
        Ok(())
    }

    async fn hot_keywords(&self, limit: u32) -> AppResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT keyword FROM search_stats
             ORDER BY hits DESC, last_searched_at DESC, keyword ASC LIMIT ?1",
        )?;
        let searched = stmt
            .query_map(params![limit], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        if !searched.is_empty() {
            return Ok(searched);
        }

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT k.word FROM keywords k
             JOIN novel_keywords nk ON nk.keyword_id = k.id
             JOIN novels ON novels.id = nk.novel_id
             WHERE {}
             GROUP BY k.id ORDER BY COUNT(*) DESC, k.word ASC LIMIT ?1",
            LIVE_APPROVED
        ))?;
        let tagged = stmt
            .query_map(params![limit], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tagged)
    }

    async fn suggestions(&self, keyword: &str, limit: u32) -> AppResult<Vec<Suggestion>> {
        let conn = self.pool.get()?;
        let pattern = like_pattern(keyword);

        let mut titles = conn.prepare_cached(&format!(
            "SELECT title, click_count FROM novels
             WHERE {} AND (title LIKE ?1 ESCAPE '\\' OR author LIKE ?1 ESCAPE '\\'
                           OR protagonist LIKE ?1 ESCAPE '\\')
             ORDER BY click_count DESC, id ASC LIMIT ?2",
            LIVE_APPROVED
        ))?;
        let mut searches = conn.prepare_cached(
            "SELECT keyword, hits FROM search_stats WHERE keyword LIKE ?1 ESCAPE '\\'
             ORDER BY hits DESC, keyword ASC LIMIT ?2",
        )?;

        let mut out: Vec<Suggestion> = Vec::new();
        let sources = [
            (&mut titles, SuggestionSource::Title),
            (&mut searches, SuggestionSource::Search),
        ];
        for (stmt, source) in sources {
            let rows = stmt
                .query_map(params![pattern, limit], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (text, count) in rows {
                if out.len() >= limit as usize {
                    return Ok(out);
                }
                if out.iter().all(|s| s.text != text) {
                    out.push(Suggestion {
                        text,
                        count,
                        source,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Assemble flat category rows into a forest ordered by id.
pub fn category_forest(flat: Vec<Category>) -> Vec<Category> {
    let mut by_parent: HashMap<Option<i64>, Vec<Category>> = HashMap::new();
    for category in flat {
        by_parent.entry(category.parent_id).or_default().push(category);
    }

    fn attach(node: &mut Category, by_parent: &mut HashMap<Option<i64>, Vec<Category>>) {
        let mut children = by_parent.remove(&Some(node.id)).unwrap_or_default();
        for child in &mut children {
            attach(child, by_parent);
        }
        node.children = children;
    }

    let mut roots = by_parent.remove(&None).unwrap_or_default();
    for root in &mut roots {
        attach(root, &mut by_parent);
    }
    roots
}

/// Type alias for Arc-wrapped repository (for AppState)
pub type DynNovelRepository = Arc<dyn NovelRepository>;
