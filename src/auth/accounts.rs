use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

use crate::db::{self, models::User};
use crate::error::{AppError, AppResult};
use crate::novels::repository::like_pattern;
use crate::state::DbPool;

#[derive(Debug)]
pub struct Registration {
    pub user: User,
    /// One-shot code the user must present to activate; `None` when the account
    /// is activated on creation.
    pub activation_code: Option<String>,
}

pub fn validate_registration(email: &str, password: &str, nickname: &str) -> AppResult<()> {
    let email = email.trim();
    if email.len() < 3 || !email.contains('@') || email.len() > 254 {
        return Err(AppError::Validation("email is invalid".into()));
    }
    validate_password(password)?;
    validate_nickname(nickname)
}

fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < 6 {
        return Err(AppError::Validation(
            "password must be at least 6 characters".into(),
        ));
    }
    Ok(())
}

fn validate_nickname(nickname: &str) -> AppResult<()> {
    let nickname_len = nickname.trim().chars().count();
    if nickname_len == 0 || nickname_len > 50 {
        return Err(AppError::Validation(
            "nickname must be 1 to 50 characters".into(),
        ));
    }
    Ok(())
}

/// Fields a user may change on their own account. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub nickname: Option<String>,
    /// Required to set `new_password`.
    #[serde(default)]
    pub old_password: Option<String>,
    #[serde(default)]
    pub new_password: Option<String>,
}

pub fn update_profile(
    pool: &DbPool,
    user_id: i64,
    update: &ProfileUpdate,
    bcrypt_cost: u32,
) -> AppResult<User> {
    if let Some(nickname) = &update.nickname {
        validate_nickname(nickname)?;
    }

    let new_hash = match (&update.new_password, &update.old_password) {
        (None, _) => None,
        (Some(_), None) => {
            return Err(AppError::Validation(
                "old_password is required to change the password".into(),
            ))
        }
        (Some(new_password), Some(old_password)) => {
            validate_password(new_password)?;
            let conn = pool.get()?;
            let current: String = conn
                .query_row(
                    "SELECT password_hash FROM users WHERE id = ?1",
                    params![user_id],
                    |r| r.get(0),
                )
                .optional()?
                .ok_or_else(|| AppError::NotFound("User".into()))?;
            if !bcrypt::verify(old_password, &current).unwrap_or(false) {
                return Err(AppError::Validation("old password is incorrect".into()));
            }
            let hash = bcrypt::hash(new_password, bcrypt_cost)
                .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))?;
            Some(hash)
        }
    };

    let conn = pool.get()?;
    conn.execute(
        "UPDATE users SET nickname = COALESCE(?2, nickname),
                          password_hash = COALESCE(?3, password_hash),
                          updated_at = datetime('now')
         WHERE id = ?1",
        params![user_id, update.nickname.as_deref().map(str::trim), new_hash],
    )?;
    find_user(&conn, user_id)?.ok_or_else(|| AppError::NotFound("User".into()))
}

/// Account states an administrator can filter the user list by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    All,
    Active,
    Frozen,
    Unactivated,
}

impl UserStatus {
    fn condition(self) -> &'static str {
        match self {
            UserStatus::All => "1 = 1",
            UserStatus::Active => "is_active = 1",
            UserStatus::Frozen => "is_active = 0",
            UserStatus::Unactivated => "is_activated = 0",
        }
    }
}

/// Newest accounts first, optionally narrowed by state and an email or
/// nickname substring.
pub fn list_users(
    pool: &DbPool,
    status: UserStatus,
    query: Option<&str>,
    page: u32,
    limit: u32,
) -> AppResult<(Vec<User>, i64)> {
    let pattern = query
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(like_pattern);
    let filter = format!(
        "{} AND (?1 IS NULL OR email LIKE ?1 ESCAPE '\\' OR nickname LIKE ?1 ESCAPE '\\')",
        status.condition()
    );

    let conn = pool.get()?;
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM users WHERE {}", filter),
        params![pattern],
        |r| r.get(0),
    )?;

    let (limit, offset) = db::page_window(page, limit);
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE {} ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        User::COLUMNS,
        filter
    ))?;
    let users = stmt
        .query_map(params![pattern, limit, offset], User::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((users, total))
}

/// Create an account. The first account on a fresh install becomes an
/// activated administrator.
pub fn register(
    pool: &DbPool,
    email: &str,
    password: &str,
    nickname: &str,
    bcrypt_cost: u32,
) -> AppResult<Registration> {
    validate_registration(email, password, nickname)?;

    let email = email.trim().to_lowercase();
    let hash = bcrypt::hash(password, bcrypt_cost)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))?;

    let conn = pool.get()?;
    let (id, activation_code) = db::immediate_transaction(&conn, |tx| {
        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        let first = existing == 0;
        let code = if first { None } else { Some(generate_code()) };

        let inserted = tx.execute(
            "INSERT INTO users (email, password_hash, nickname, is_admin, is_activated, activation_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![email, hash, nickname.trim(), first, first, code],
        );
        match inserted {
            Ok(_) => Ok((tx.last_insert_rowid(), code)),
            Err(e) if db::is_unique_violation(&e) => Err(AppError::StateConflict(
                "email already registered".into(),
            )),
            Err(e) => Err(e.into()),
        }
    })?;

    let user = find_user(&conn, id)?.ok_or_else(|| AppError::NotFound("User".into()))?;
    Ok(Registration {
        user,
        activation_code,
    })
}

pub fn activate(pool: &DbPool, email: &str, code: &str) -> AppResult<()> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE users SET is_activated = 1, activation_code = NULL, updated_at = datetime('now')
         WHERE email = ?1 AND activation_code = ?2",
        params![email.trim().to_lowercase(), code.trim()],
    )?;
    if updated == 0 {
        return Err(AppError::Validation(
            "activation code is invalid or already used".into(),
        ));
    }
    Ok(())
}

/// Check credentials and stamp the login time.
pub fn authenticate(pool: &DbPool, email: &str, password: &str) -> AppResult<User> {
    let conn = pool.get()?;
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE email = ?1",
            params![email.trim().to_lowercase()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let (id, hash) = row.ok_or(AppError::Unauthenticated)?;
    if !bcrypt::verify(password, &hash).unwrap_or(false) {
        return Err(AppError::Unauthenticated);
    }

    let user = find_user(&conn, id)?.ok_or(AppError::Unauthenticated)?;
    ensure_usable(&user)?;

    conn.execute(
        "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
        params![db::timestamp(Utc::now()), id],
    )?;

    Ok(user)
}

/// Frozen accounts are refused everywhere; unactivated ones cannot act.
pub fn ensure_usable(user: &User) -> AppResult<()> {
    if !user.is_active {
        return Err(AppError::Forbidden("account is frozen".into()));
    }
    if !user.is_activated {
        return Err(AppError::Forbidden("account is not activated".into()));
    }
    Ok(())
}

pub fn find_user(conn: &Connection, id: i64) -> AppResult<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", User::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], User::from_row)
        .optional()?)
}

fn generate_code() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_pool() -> (DbPool, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool(&dir.path().join("test.db")).unwrap();
        db::run_migrations(&pool).unwrap();
        (pool, dir)
    }

    #[test]
    fn first_user_is_activated_admin() {
        let (pool, _dir) = test_pool();
        let first = register(&pool, "Root@Example.com", "secret1", "root", 4).unwrap();
        assert!(first.user.is_admin);
        assert!(first.user.is_activated);
        assert!(first.activation_code.is_none());
        assert_eq!(first.user.email, "root@example.com");

        let second = register(&pool, "reader@example.com", "secret2", "reader", 4).unwrap();
        assert!(!second.user.is_admin);
        assert!(!second.user.is_activated);
        assert_eq!(second.activation_code.as_ref().map(|c| c.len()), Some(32));
    }

    #[test]
    fn duplicate_email_conflicts() {
        let (pool, _dir) = test_pool();
        register(&pool, "a@example.com", "secret1", "a", 4).unwrap();
        let err = register(&pool, "A@example.com", "secret1", "b", 4).unwrap_err();
        assert!(matches!(err, AppError::StateConflict(_)));
    }

    #[test]
    fn registration_validates_input() {
        assert!(validate_registration("nope", "secret1", "n").is_err());
        assert!(validate_registration("a@b.c", "123", "n").is_err());
        assert!(validate_registration("a@b.c", "secret1", "   ").is_err());
        assert!(validate_registration("a@b.c", "secret1", "读者").is_ok());
    }

    #[test]
    fn login_requires_activation() {
        let (pool, _dir) = test_pool();
        register(&pool, "admin@example.com", "secret1", "admin", 4).unwrap();
        let reg = register(&pool, "r@example.com", "secret1", "r", 4).unwrap();

        let err = authenticate(&pool, "r@example.com", "secret1").unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        assert!(activate(&pool, "r@example.com", "wrong").is_err());
        activate(&pool, "r@example.com", reg.activation_code.as_deref().unwrap()).unwrap();
        let user = authenticate(&pool, "r@example.com", "secret1").unwrap();
        assert_eq!(user.id, reg.user.id);

        // The code is one-shot.
        assert!(activate(&pool, "r@example.com", reg.activation_code.as_deref().unwrap()).is_err());
    }

    #[test]
    fn wrong_password_is_unauthenticated() {
        let (pool, _dir) = test_pool();
        register(&pool, "admin@example.com", "secret1", "admin", 4).unwrap();
        let err = authenticate(&pool, "admin@example.com", "nope").unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated));
        let err = authenticate(&pool, "ghost@example.com", "secret1").unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated));
    }

    #[test]
    fn profile_update_changes_nickname_and_password() {
        let (pool, _dir) = test_pool();
        let reg = register(&pool, "admin@example.com", "secret1", "admin", 4).unwrap();
        let id = reg.user.id;

        let renamed = update_profile(
            &pool,
            id,
            &ProfileUpdate { nickname: Some(" 掌柜 ".into()), ..Default::default() },
            4,
        )
        .unwrap();
        assert_eq!(renamed.nickname, "掌柜");

        let wrong = ProfileUpdate {
            old_password: Some("nope".into()),
            new_password: Some("secret2".into()),
            ..Default::default()
        };
        assert!(matches!(update_profile(&pool, id, &wrong, 4), Err(AppError::Validation(_))));
        let missing_old = ProfileUpdate {
            new_password: Some("secret2".into()),
            ..Default::default()
        };
        assert!(update_profile(&pool, id, &missing_old, 4).is_err());

        let change = ProfileUpdate {
            old_password: Some("secret1".into()),
            new_password: Some("secret2".into()),
            ..Default::default()
        };
        let changed = update_profile(&pool, id, &change, 4).unwrap();
        assert_eq!(changed.nickname, "掌柜");
        assert!(authenticate(&pool, "admin@example.com", "secret1").is_err());
        assert!(authenticate(&pool, "admin@example.com", "secret2").is_ok());

        let blank = ProfileUpdate { nickname: Some("  ".into()), ..Default::default() };
        assert!(update_profile(&pool, id, &blank, 4).is_err());
    }

    #[test]
    fn user_list_filters_by_state_and_text() {
        let (pool, _dir) = test_pool();
        register(&pool, "admin@example.com", "secret1", "admin", 4).unwrap();
        let reader = register(&pool, "reader@example.com", "secret1", "读者", 4).unwrap();
        let frozen = register(&pool, "frozen@example.com", "secret1", "冻结", 4).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(&format!(
                "UPDATE users SET is_activated = 1 WHERE id = {};
                 UPDATE users SET is_active = 0, is_activated = 1 WHERE id = {};",
                reader.user.id, frozen.user.id
            ))
            .unwrap();

        let (all, total) = list_users(&pool, UserStatus::All, None, 1, 10).unwrap();
        assert_eq!(total, 3);
        assert_eq!(all[0].id, frozen.user.id);

        let (items, total) = list_users(&pool, UserStatus::Frozen, None, 1, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].email, "frozen@example.com");

        let (items, _) = list_users(&pool, UserStatus::Active, Some("读"), 1, 10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, reader.user.id);

        let (_, total) = list_users(&pool, UserStatus::Unactivated, None, 1, 10).unwrap();
        assert_eq!(total, 0);
        let (page_two, total) = list_users(&pool, UserStatus::All, None, 2, 2).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page_two.len(), 1);
    }

    #[test]
    fn frozen_user_cannot_log_in() {
        let (pool, _dir) = test_pool();
        let reg = register(&pool, "admin@example.com", "secret1", "admin", 4).unwrap();
        pool.get()
            .unwrap()
            .execute("UPDATE users SET is_active = 0 WHERE id = ?1", params![reg.user.id])
            .unwrap();
        let err = authenticate(&pool, "admin@example.com", "secret1").unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
