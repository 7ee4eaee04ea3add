//! Administrator-managed catalog data: categories, system messages and
//! review criteria. Each mutation is audited on its own transaction.

use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

use super::repository::{log_action, TargetKind};
use crate::db::{self, models::Category, models::ReviewCriterion, models::SystemMessage};
use crate::error::{AppError, AppResult};
use crate::state::DbPool;

const MAX_NAME_CHARS: usize = 50;
const MAX_TITLE_CHARS: usize = 200;
const MAX_CONTENT_CHARS: usize = 10_000;
const CRITERION_KINDS: &[&str] = &["novel", "comment", "rating"];

#[derive(Debug, Clone, Deserialize)]
pub struct CriterionInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: String,
    #[serde(default)]
    pub weight: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl CriterionInput {
    pub fn validate(&self) -> AppResult<()> {
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
            return Err(AppError::Validation(format!(
                "name must be 1 to {} characters",
                MAX_NAME_CHARS
            )));
        }
        if !CRITERION_KINDS.contains(&self.kind.as_str()) {
            return Err(AppError::Validation(
                "kind must be one of novel, comment, rating".into(),
            ));
        }
        if !(0..=100).contains(&self.weight) {
            return Err(AppError::Validation("weight must be between 0 and 100".into()));
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str, max: usize) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() || value.chars().count() > max {
        return Err(AppError::Validation(format!(
            "{} must be 1 to {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}

#[derive(Clone)]
pub struct AdminCatalog {
    pool: DbPool,
}

impl AdminCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create_category(
        &self,
        admin_id: i64,
        name: &str,
        parent_id: Option<i64>,
    ) -> AppResult<Category> {
        let name = require_text("name", name, MAX_NAME_CHARS)?;
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            if let Some(parent) = parent_id {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?1)",
                    params![parent],
                    |r| r.get(0),
                )?;
                if !exists {
                    return Err(AppError::Validation(format!("unknown parent category {}", parent)));
                }
            }
            conn.execute(
                "INSERT INTO categories (name, parent_id) VALUES (?1, ?2)",
                params![name, parent_id],
            )?;
            let id = conn.last_insert_rowid();
            log_action(conn, admin_id, "create_category", TargetKind::System, id, &name)?;
            Ok(Category {
                id,
                name: name.clone(),
                parent_id,
                children: Vec::new(),
            })
        })
    }

    pub fn create_message(
        &self,
        admin_id: i64,
        title: &str,
        content: &str,
    ) -> AppResult<SystemMessage> {
        let title = require_text("title", title, MAX_TITLE_CHARS)?;
        let content = require_text("content", content, MAX_CONTENT_CHARS)?;
        let conn = self.pool.get()?;

        db::immediate_transaction(&conn, |conn| {
            conn.execute(
                "INSERT INTO system_messages (admin_id, title, content) VALUES (?1, ?2, ?3)",
                params![admin_id, title, content],
            )?;
            let id = conn.last_insert_rowid();
            log_action(conn, admin_id, "create_message", TargetKind::System, id, &title)?;
            let message = conn.query_row(
                &format!("SELECT {} FROM system_messages WHERE id = ?1", SystemMessage::COLUMNS),
                params![id],
                SystemMessage::from_row,
            )?;
            Ok(message)
        })
    }

    pub fn list_messages(
        &self,
        published_only: bool,
        page: u32,
        limit: u32,
    ) -> AppResult<(Vec<SystemMessage>, i64)> {
        let conn = self.pool.get()?;
        let filter = "deleted_at IS NULL AND (?1 = 0 OR is_published = 1)";
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM system_messages WHERE {}", filter),
            params![published_only],
            |r| r.get(0),
        )?;

        let (limit, offset) = db::page_window(page, limit);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM system_messages WHERE {} ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            SystemMessage::COLUMNS,
            filter
        ))?;
        let items = stmt
            .query_map(params![published_only, limit, offset], SystemMessage::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total))
    }

    /// Publishing an already published message changes nothing.
    pub fn publish_message(&self, admin_id: i64, id: i64) -> AppResult<()> {
        let conn = self.pool.get()?;
        db::immediate_transaction(&conn, |conn| {
            let published: Option<bool> = conn
                .query_row(
                    "SELECT is_published FROM system_messages WHERE id = ?1 AND deleted_at IS NULL",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?;
            match published {
                None => Err(AppError::NotFound("Message".into())),
                Some(true) => Ok(()),
                Some(false) => {
                    conn.execute(
                        "UPDATE system_messages SET is_published = 1, updated_at = datetime('now')
                         WHERE id = ?1",
                        params![id],
                    )?;
                    log_action(conn, admin_id, "publish_message", TargetKind::System, id, "")
                }
            }
        })
    }

    pub fn delete_message(&self, admin_id: i64, id: i64) -> AppResult<()> {
        let conn = self.pool.get()?;
        db::immediate_transaction(&conn, |conn| {
            let rows = conn.execute(
                "UPDATE system_messages SET deleted_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )?;
            if rows == 0 {
                return Err(AppError::NotFound("Message".into()));
            }
            log_action(conn, admin_id, "delete_message", TargetKind::System, id, "")
        })
    }

    pub fn list_criteria(&self) -> AppResult<Vec<ReviewCriterion>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM review_criteria WHERE deleted_at IS NULL ORDER BY kind, weight DESC, id",
            ReviewCriterion::COLUMNS
        ))?;
        let items = stmt
            .query_map([], ReviewCriterion::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn create_criterion(&self, admin_id: i64, input: &CriterionInput) -> AppResult<ReviewCriterion> {
        input.validate()?;
        let conn = self.pool.get()?;
        db::immediate_transaction(&conn, |conn| {
            conn.execute(
                "INSERT INTO review_criteria (name, description, kind, weight, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    input.name.trim(),
                    input.description.trim(),
                    input.kind,
                    input.weight,
                    input.active
                ],
            )?;
            let id = conn.last_insert_rowid();
            log_action(conn, admin_id, "create_criterion", TargetKind::System, id, input.name.trim())?;
            fetch_criterion(conn, id)
        })
    }

    pub fn update_criterion(
        &self,
        admin_id: i64,
        id: i64,
        input: &CriterionInput,
    ) -> AppResult<ReviewCriterion> {
        input.validate()?;
        let conn = self.pool.get()?;
        db::immediate_transaction(&conn, |conn| {
            let rows = conn.execute(
                "UPDATE review_criteria
                 SET name = ?2, description = ?3, kind = ?4, weight = ?5, is_active = ?6,
                     updated_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![
                    id,
                    input.name.trim(),
                    input.description.trim(),
                    input.kind,
                    input.weight,
                    input.active
                ],
            )?;
            if rows == 0 {
                return Err(AppError::NotFound("Criterion".into()));
            }
            log_action(conn, admin_id, "update_criterion", TargetKind::System, id, input.name.trim())?;
            fetch_criterion(conn, id)
        })
    }

    pub fn delete_criterion(&self, admin_id: i64, id: i64) -> AppResult<()> {
        let conn = self.pool.get()?;
        db::immediate_transaction(&conn, |conn| {
            let rows = conn.execute(
                "UPDATE review_criteria SET deleted_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )?;
            if rows == 0 {
                return Err(AppError::NotFound("Criterion".into()));
            }
            log_action(conn, admin_id, "delete_criterion", TargetKind::System, id, "")
        })
    }
}

fn fetch_criterion(conn: &rusqlite::Connection, id: i64) -> AppResult<ReviewCriterion> {
    let criterion = conn.query_row(
        &format!("SELECT {} FROM review_criteria WHERE id = ?1", ReviewCriterion::COLUMNS),
        params![id],
        ReviewCriterion::from_row,
    )?;
    Ok(criterion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DbPool, AdminCatalog) {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("catalog.db")).unwrap();
        db::run_migrations(&pool).unwrap();
        (dir, pool.clone(), AdminCatalog::new(pool))
    }

    fn actions(pool: &DbPool) -> Vec<String> {
        let conn = pool.get().unwrap();
        let mut stmt = conn.prepare("SELECT action FROM admin_logs ORDER BY id").unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn categories_need_an_existing_parent() {
        let (_dir, pool, catalog) = setup();
        let root = catalog.create_category(1, "玄幻", None).unwrap();
        let child = catalog.create_category(1, "东方玄幻", Some(root.id)).unwrap();
        assert_eq!(child.parent_id, Some(root.id));
        assert!(matches!(
            catalog.create_category(1, "孤儿", Some(999)),
            Err(AppError::Validation(_))
        ));
        assert!(catalog.create_category(1, "  ", None).is_err());
        assert_eq!(actions(&pool), vec!["create_category", "create_category"]);
    }

    #[test]
    fn messages_are_public_once_published() {
        let (_dir, pool, catalog) = setup();
        let message = catalog.create_message(1, "维护通知", "今晚维护").unwrap();
        assert!(!message.is_published);
        assert_eq!(catalog.list_messages(true, 1, 10).unwrap().1, 0);

        catalog.publish_message(1, message.id).unwrap();
        catalog.publish_message(1, message.id).unwrap();
        let (public, total) = catalog.list_messages(true, 1, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(public[0].title, "维护通知");

        catalog.delete_message(1, message.id).unwrap();
        assert!(matches!(
            catalog.delete_message(1, message.id),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(
            actions(&pool),
            vec!["create_message", "publish_message", "delete_message"]
        );
    }

    #[test]
    fn criteria_are_validated_and_audited() {
        let (_dir, pool, catalog) = setup();
        let mut input = CriterionInput {
            name: "无违规内容".into(),
            description: String::new(),
            kind: "novel".into(),
            weight: 80,
            active: true,
        };
        let created = catalog.create_criterion(1, &input).unwrap();
        assert_eq!(created.weight, 80);

        input.weight = 101;
        assert!(catalog.update_criterion(1, created.id, &input).is_err());
        input.weight = 10;
        input.kind = "user".into();
        assert!(catalog.update_criterion(1, created.id, &input).is_err());
        input.kind = "comment".into();
        let updated = catalog.update_criterion(1, created.id, &input).unwrap();
        assert_eq!(updated.kind, "comment");

        catalog.delete_criterion(1, created.id).unwrap();
        assert!(catalog.list_criteria().unwrap().is_empty());
        assert_eq!(
            actions(&pool),
            vec!["create_criterion", "update_criterion", "delete_criterion"]
        );
    }
}
