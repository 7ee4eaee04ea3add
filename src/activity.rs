use rusqlite::params;

use crate::db::{self, models::UserActivity};
use crate::error::AppResult;
use crate::state::DbPool;

/// An observational trace: login attempts, uploads, parse failures.
#[derive(Debug, Clone, Default)]
pub struct ActivityEntry {
    /// 0 for anonymous or system activity.
    pub user_id: i64,
    pub action: String,
    pub ip: String,
    pub user_agent: String,
    pub detail: String,
    pub success: bool,
}

impl ActivityEntry {
    pub fn new(user_id: i64, action: impl Into<String>, success: bool) -> Self {
        Self {
            user_id,
            action: action.into(),
            success,
            ..Default::default()
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn client(mut self, ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip = ip.into();
        self.user_agent = user_agent.into();
        self
    }
}

/// Writes user activity off the request path. Failures are logged and dropped.
#[derive(Clone)]
pub struct ActivityRecorder {
    pool: DbPool,
}

impl ActivityRecorder {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn record(&self, entry: ActivityEntry) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = insert(&pool, &entry) {
                tracing::warn!(error = %e, action = %entry.action, "failed to record user activity");
            }
        });
    }

    pub fn list(
        &self,
        user_id: Option<i64>,
        action: Option<&str>,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<UserActivity>, i64)> {
        let conn = self.pool.get()?;
        let action_pattern = action.map(|a| format!("%{}%", a));
        let filter = "(?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR action LIKE ?2)";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM user_activities WHERE {}", filter),
            params![user_id, action_pattern],
            |r| r.get(0),
        )?;

        let (limit, offset) = db::page_window(page, limit);
        let sql = format!(
            "SELECT {} FROM user_activities WHERE {} ORDER BY id DESC LIMIT ?3 OFFSET ?4",
            UserActivity::COLUMNS,
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                params![user_id, action_pattern, limit, offset],
                UserActivity::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((items, total))
    }
}

pub fn insert(pool: &DbPool, entry: &ActivityEntry) -> AppResult<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO user_activities (user_id, action, ip, user_agent, detail, success)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.user_id,
            entry.action,
            entry.ip,
            entry.user_agent,
            entry.detail,
            entry.success
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn list_filters_by_user_and_action() {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("a.db")).unwrap();
        db::run_migrations(&pool).unwrap();

        insert(&pool, &ActivityEntry::new(0, "login", false).detail("bad password")).unwrap();
        insert(&pool, &ActivityEntry::new(5, "login", true)).unwrap();
        insert(&pool, &ActivityEntry::new(5, "upload_novel", true)).unwrap();

        let recorder = ActivityRecorder::new(pool);
        let (all, total) = recorder.list(None, None, 1, 10).unwrap();
        assert_eq!(total, 3);
        assert_eq!(all[0].action, "upload_novel");

        let (mine, total) = recorder.list(Some(5), None, 1, 10).unwrap();
        assert_eq!(total, 2);
        assert!(mine.iter().all(|a| a.user_id == 5));

        let (logins, _) = recorder.list(None, Some("login"), 1, 10).unwrap();
        assert_eq!(logins.len(), 2);
        assert!(logins.iter().any(|a| !a.success && a.detail == "bad password"));
    }
}
