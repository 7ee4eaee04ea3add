// Read-only queries behind the recommender
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::similarity::Features;
use crate::error::AppResult;
use crate::novels::repository::{find_novel, load_details};
use crate::novels::{Novel, NovelDetail, NovelStatus};
use crate::state::DbPool;

/// Rating at or above which a rated novel feeds the reader profile.
pub const LIKED_SCORE: f64 = 7.0;
/// Reading progress (percent) above which a novel feeds the reader profile.
pub const READ_PROGRESS: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub novel: Novel,
    pub features: Features,
}

#[derive(Debug, Clone, Default)]
pub struct ReaderProfile {
    pub features: Features,
    /// Novels with any reading progress; never recommended back.
    pub read: HashSet<i64>,
}

#[async_trait]
pub trait RecommendRepository: Send + Sync {
    async fn hot(&self, limit: u32) -> AppResult<Vec<NovelDetail>>;

    async fn newest(&self, limit: u32) -> AppResult<Vec<NovelDetail>>;

    async fn random(&self, limit: u32) -> AppResult<Vec<NovelDetail>>;

    /// Features of a live, approved novel.
    async fn seed(&self, novel_id: i64) -> AppResult<Option<Candidate>>;

    /// The most clicked approved novels sharing a category, keyword or
    /// author with `like`, excluding `exclude`.
    async fn candidates(
        &self,
        like: &Features,
        exclude: &HashSet<i64>,
        limit: u32,
    ) -> AppResult<Vec<Candidate>>;

    async fn profile(&self, user_id: i64) -> AppResult<ReaderProfile>;

    /// Details for `ids`, in the order given.
    async fn details(&self, ids: &[i64]) -> AppResult<Vec<NovelDetail>>;
}

pub struct SqliteRecommendRepository {
    pool: DbPool,
}

impl SqliteRecommendRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const LIVE_APPROVED: &str = "status = 'approved' AND deleted_at IS NULL";

fn ranked(conn: &Connection, order_by: &str, limit: u32) -> AppResult<Vec<NovelDetail>> {
    let sql = format!(
        "SELECT {} FROM novels WHERE {} ORDER BY {} LIMIT ?1",
        Novel::COLUMNS,
        LIVE_APPROVED,
        order_by
    );
    let mut stmt = conn.prepare(&sql)?;
    let novels = stmt
        .query_map(params![limit], Novel::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    load_details(conn, novels)
}

fn in_list(len: usize) -> String {
    vec!["?"; len].join(", ")
}

/// Category and keyword ids for each novel in `novels`.
fn attach_features(conn: &Connection, novels: Vec<Novel>) -> AppResult<Vec<Candidate>> {
    if novels.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = novels.iter().map(|n| n.id).collect();
    let mut categories: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut keywords: HashMap<i64, Vec<i64>> = HashMap::new();

    for (table, column, into) in [
        ("novel_categories", "category_id", &mut categories),
        ("novel_keywords", "keyword_id", &mut keywords),
    ] {
        let sql = format!(
            "SELECT novel_id, {} FROM {} WHERE novel_id IN ({})",
            column,
            table,
            in_list(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (novel_id, value) = row?;
            into.entry(novel_id).or_default().push(value);
        }
    }

    Ok(novels
        .into_iter()
        .map(|novel| {
            let features = Features::new(
                categories.remove(&novel.id).unwrap_or_default(),
                keywords.remove(&novel.id).unwrap_or_default(),
                &novel.author,
            );
            Candidate { novel, features }
        })
        .collect())
}

#[async_trait]
impl RecommendRepository for SqliteRecommendRepository {
    async fn hot(&self, limit: u32) -> AppResult<Vec<NovelDetail>> {
        let conn = self.pool.get()?;
        ranked(&conn, "click_count DESC, created_at DESC, id DESC", limit)
    }

    async fn newest(&self, limit: u32) -> AppResult<Vec<NovelDetail>> {
        let conn = self.pool.get()?;
        ranked(&conn, "created_at DESC, id DESC", limit)
    }

    async fn random(&self, limit: u32) -> AppResult<Vec<NovelDetail>> {
        let conn = self.pool.get()?;
        ranked(&conn, "RANDOM()", limit)
    }

    async fn seed(&self, novel_id: i64) -> AppResult<Option<Candidate>> {
        let conn = self.pool.get()?;
        let Some(novel) = find_novel(&conn, novel_id)? else {
            return Ok(None);
        };
        if novel.is_deleted() || novel.status != NovelStatus::Approved {
            return Ok(None);
        }
        Ok(attach_features(&conn, vec![novel])?.pop())
    }

    async fn candidates(
        &self,
        like: &Features,
        exclude: &HashSet<i64>,
        limit: u32,
    ) -> AppResult<Vec<Candidate>> {
        let mut matches = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !like.categories.is_empty() {
            matches.push(format!(
                "id IN (SELECT novel_id FROM novel_categories WHERE category_id IN ({}))",
                in_list(like.categories.len())
            ));
            values.extend(like.categories.iter().map(|id| Value::Integer(*id)));
        }
        if !like.keywords.is_empty() {
            matches.push(format!(
                "id IN (SELECT novel_id FROM novel_keywords WHERE keyword_id IN ({}))",
                in_list(like.keywords.len())
            ));
            values.extend(like.keywords.iter().map(|id| Value::Integer(*id)));
        }
        if !like.authors.is_empty() {
            matches.push(format!("author IN ({})", in_list(like.authors.len())));
            values.extend(like.authors.iter().map(|a| Value::Text(a.clone())));
        }
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {} FROM novels WHERE {} AND ({})",
            Novel::COLUMNS,
            LIVE_APPROVED,
            matches.join(" OR ")
        );
        if !exclude.is_empty() {
            sql.push_str(&format!(" AND id NOT IN ({})", in_list(exclude.len())));
            values.extend(exclude.iter().map(|id| Value::Integer(*id)));
        }
        sql.push_str(" ORDER BY click_count DESC, created_at DESC, id DESC LIMIT ?");
        values.push(Value::Integer(i64::from(limit)));

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let novels = stmt
            .query_map(params_from_iter(values.iter()), Novel::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        attach_features(&conn, novels)
    }

    async fn profile(&self, user_id: i64) -> AppResult<ReaderProfile> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM novels WHERE deleted_at IS NULL AND id IN (
                 SELECT novel_id FROM ratings
                  WHERE user_id = ?1 AND score >= ?2 AND deleted_at IS NULL
                 UNION
                 SELECT novel_id FROM comments WHERE user_id = ?1 AND deleted_at IS NULL
                 UNION
                 SELECT novel_id FROM reading_progress WHERE user_id = ?1 AND progress > ?3
             )",
            Novel::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let liked = stmt
            .query_map(params![user_id, LIKED_SCORE, READ_PROGRESS], Novel::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut features = Features::default();
        for candidate in attach_features(&conn, liked)? {
            features.merge(candidate.features);
        }

        let mut stmt =
            conn.prepare("SELECT novel_id FROM reading_progress WHERE user_id = ?1")?;
        let read = stmt
            .query_map(params![user_id], |r| r.get::<_, i64>(0))?
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(ReaderProfile { features, read })
    }

    async fn details(&self, ids: &[i64]) -> AppResult<Vec<NovelDetail>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM novels WHERE id IN ({})",
            Novel::COLUMNS,
            in_list(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut by_id: HashMap<i64, Novel> = stmt
            .query_map(params_from_iter(ids.iter()), Novel::from_row)?
            .map(|r| r.map(|n| (n.id, n)))
            .collect::<Result<_, _>>()?;
        let ordered = ids.iter().filter_map(|id| by_id.remove(id)).collect();
        load_details(&conn, ordered)
    }
}

pub type DynRecommendRepository = Arc<dyn RecommendRepository>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DbPool, SqliteRecommendRepository) {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("r.db")).unwrap();
        db::run_migrations(&pool).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "INSERT INTO users (id, email, password_hash, nickname) VALUES (1, 'a@b.c', 'x', 'r');
                 INSERT INTO categories (id, name) VALUES (1, 'A'), (2, 'B'), (3, 'C');
                 INSERT INTO keywords (id, word) VALUES (10, 'x'), (11, 'y');
                 INSERT INTO novels (id, title, author, blob_path, file_size, content_hash, uploader_id, status, click_count, created_at)
                 VALUES (1, 'seed', 'u', 'p1', 1, 'h1', 1, 'approved', 5, '2024-01-01 00:00:00'),
                        (2, 'p', 'u', 'p2', 1, 'h2', 1, 'approved', 50, '2024-01-02 00:00:00'),
                        (3, 'q', 'v', 'p3', 1, 'h3', 1, 'approved', 80, '2024-01-03 00:00:00'),
                        (4, 'pending', 'u', 'p4', 1, 'h4', 1, 'pending', 999, '2024-01-04 00:00:00'),
                        (5, 'unrelated', 'w', 'p5', 1, 'h5', 1, 'approved', 1000, '2024-01-05 00:00:00');
                 INSERT INTO novel_categories VALUES (1, 1), (1, 2), (2, 1), (2, 2), (2, 3), (3, 1), (4, 1), (5, 3);
                 INSERT INTO novel_keywords VALUES (1, 10), (1, 11), (2, 10), (3, 10);",
            )
            .unwrap();
        let repo = SqliteRecommendRepository::new(pool.clone());
        (dir, pool, repo)
    }

    #[tokio::test]
    async fn hot_and_new_scan_approved_only() {
        let (_dir, _pool, repo) = setup();
        let hot: Vec<i64> = repo.hot(10).await.unwrap().iter().map(|d| d.novel.id).collect();
        assert_eq!(hot, vec![5, 3, 2, 1]);
        let newest: Vec<i64> = repo.newest(2).await.unwrap().iter().map(|d| d.novel.id).collect();
        assert_eq!(newest, vec![5, 3]);
        assert_eq!(repo.random(10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn candidates_share_a_feature_and_skip_excluded() {
        let (_dir, _pool, repo) = setup();
        let seed = repo.seed(1).await.unwrap().unwrap();
        assert_eq!(seed.features, Features::new([1, 2], [10, 11], "u"));

        let found = repo
            .candidates(&seed.features, &HashSet::from([1]), 10)
            .await
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|c| c.novel.id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert!(repo.seed(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn profile_collects_liked_commented_and_read_novels() {
        let (_dir, pool, repo) = setup();
        pool.get()
            .unwrap()
            .execute_batch(
                "INSERT INTO ratings (novel_id, user_id, score) VALUES (1, 1, 8.5);
                 INSERT INTO reading_progress (user_id, novel_id, progress) VALUES (1, 5, 10);",
            )
            .unwrap();
        let profile = repo.profile(1).await.unwrap();
        assert_eq!(profile.features, Features::new([1, 2], [10, 11], "u"));
        assert_eq!(profile.read, HashSet::from([5]));
    }

    #[tokio::test]
    async fn details_keep_the_requested_order() {
        let (_dir, _pool, repo) = setup();
        let ids: Vec<i64> = repo
            .details(&[3, 1, 2])
            .await
            .unwrap()
            .iter()
            .map(|d| d.novel.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }
}
