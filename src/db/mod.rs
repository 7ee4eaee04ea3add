pub mod models;

use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use rusqlite::{params, Connection};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::error::AppResult;
use crate::state::DbPool;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_initial",
        include_str!("../../migrations/001_initial.sql"),
    ),
    ("002_social", include_str!("../../migrations/002_social.sql")),
    ("003_admin", include_str!("../../migrations/003_admin.sql")),
    (
        "004_click_buckets",
        include_str!("../../migrations/004_click_buckets.sql"),
    ),
    (
        "005_search_and_likes",
        include_str!("../../migrations/005_search_and_likes.sql"),
    ),
];

/// Timestamp format shared with SQLite's `datetime('now')`, so string
/// comparison orders rows chronologically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Per-connection pragmas; journal mode is a property of the file.
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    Ok(pool)
}

pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    let conn = pool.get()?;

    // Create migrations tracking table
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for (name, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_version WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;

        if !already_applied {
            tracing::info!("Applying migration: {}", name);
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_version (name) VALUES (?1)",
                params![name],
            )?;
        }
    }

    tracing::info!("Database migrations complete");
    Ok(())
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on any error.
pub fn immediate_transaction<T, E, F>(conn: &Connection, f: F) -> Result<T, E>
where
    F: FnOnce(&Connection) -> Result<T, E>,
    E: From<rusqlite::Error>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = f(conn).and_then(|value| {
        conn.execute_batch("COMMIT")?;
        Ok(value)
    });

    if result.is_err() && !conn.is_autocommit() {
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %e, "rollback failed");
        }
    }

    result
}

/// Run a read, retrying once after a short jittered pause when the store fails.
/// Writes must not go through here.
pub async fn read_with_retry<T, F, Fut>(mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match op().await {
        Err(err) if err.is_storage() => {
            let pause_ms = rand::thread_rng().gen_range(20..=80);
            tracing::warn!(error = %err, pause_ms, "storage read failed, retrying once");
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
            op().await
        }
        other => other,
    }
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// True when a write failed on a UNIQUE or PRIMARY KEY constraint.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

/// `LIMIT` / `OFFSET` for a 1-based page.
pub fn page_window(page: u32, limit: u32) -> (i64, i64) {
    let page = page.max(1) as i64;
    let limit = limit as i64;
    (limit, (page - 1) * limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_pool() -> DbPool {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        Pool::builder().max_size(1).build(manager).unwrap()
    }

    #[test]
    fn create_pool_creates_db_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("sub/dir/test.db");
        let pool = create_pool(&db_path).unwrap();
        assert!(db_path.exists());
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn migrations_run_successfully() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        for table in [
            "users",
            "novels",
            "chapters",
            "categories",
            "keywords",
            "comments",
            "ratings",
            "reading_progress",
            "admin_logs",
            "user_activities",
            "system_messages",
            "review_criteria",
            "click_buckets",
            "search_stats",
            "comment_likes",
            "rating_likes",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn live_hash_index_allows_reupload_after_reject() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (email, password_hash, nickname) VALUES ('a@b.c', 'x', 'a')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO novels (title, blob_path, file_size, content_hash, uploader_id, status)
                      VALUES ('t', 'uploads/h.txt', 4, 'h', 1, ?1)";
        conn.execute(insert, params!["pending"]).unwrap();
        assert!(conn.execute(insert, params!["pending"]).is_err());

        conn.execute("UPDATE novels SET status = 'rejected'", []).unwrap();
        conn.execute(insert, params!["pending"]).unwrap();
    }

    #[test]
    fn foreign_keys_enforced() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        let result = conn.execute(
            "INSERT INTO novels (title, blob_path, file_size, content_hash, uploader_id)
             VALUES ('t', 'p', 1, 'h', 999)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();

        let result: Result<(), AppError> = immediate_transaction(&conn, |tx| {
            tx.execute(
                "INSERT INTO keywords (word) VALUES ('rolled-back')",
                [],
            )?;
            Err(AppError::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM keywords", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn transaction_commits_on_success() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();

        let id: i64 = immediate_transaction::<_, AppError, _>(&conn, |tx| {
            tx.execute("INSERT INTO keywords (word) VALUES ('kept')", [])?;
            Ok(tx.last_insert_rowid())
        })
        .unwrap();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn read_with_retry_retries_storage_errors_once() {
        let calls = AtomicUsize::new(0);
        let result: AppResult<u32> = read_with_retry(|| {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    Err(AppError::Storage("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_with_retry_passes_domain_errors_through() {
        let calls = AtomicUsize::new(0);
        let result: AppResult<u32> = read_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::NotFound("novel".into())) }
        })
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timestamps_round_trip_through_sqlite_format() {
        let at = parse_timestamp("2024-03-01 12:30:05").unwrap();
        assert_eq!(timestamp(at), "2024-03-01 12:30:05");
        assert!(parse_timestamp("not a time").is_none());
    }

    #[test]
    fn page_window_is_one_based() {
        assert_eq!(page_window(1, 20), (20, 0));
        assert_eq!(page_window(3, 10), (10, 20));
        assert_eq!(page_window(0, 10), (10, 0));
    }
}
