use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub nickname: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub is_activated: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
}

impl User {
    pub const COLUMNS: &'static str =
        "id, email, nickname, is_active, is_admin, is_activated, last_login_at, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            nickname: row.get(2)?,
            is_active: row.get(3)?,
            is_admin: row.get(4)?,
            is_activated: row.get(5)?,
            last_login_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// `{id, name}` pair used for uploader, category and keyword references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Category>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminLog {
    pub id: i64,
    pub admin_id: i64,
    pub action: String,
    pub target_kind: String,
    pub target_id: i64,
    pub detail: String,
    pub created_at: String,
}

impl AdminLog {
    pub const COLUMNS: &'static str =
        "id, admin_id, action, target_kind, target_id, detail, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            admin_id: row.get(1)?,
            action: row.get(2)?,
            target_kind: row.get(3)?,
            target_id: row.get(4)?,
            detail: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivity {
    pub id: i64,
    pub user_id: i64,
    pub action: String,
    pub ip: String,
    pub user_agent: String,
    pub detail: String,
    pub success: bool,
    pub created_at: String,
}

impl UserActivity {
    pub const COLUMNS: &'static str =
        "id, user_id, action, ip, user_agent, detail, success, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            action: row.get(2)?,
            ip: row.get(3)?,
            user_agent: row.get(4)?,
            detail: row.get(5)?,
            success: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    pub id: i64,
    pub admin_id: i64,
    pub title: String,
    pub content: String,
    pub is_published: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl SystemMessage {
    pub const COLUMNS: &'static str =
        "id, admin_id, title, content, is_published, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            admin_id: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            is_published: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCriterion {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub kind: String,
    pub weight: i64,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ReviewCriterion {
    pub const COLUMNS: &'static str =
        "id, name, description, kind, weight, is_active, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            kind: row.get(3)?,
            weight: row.get(4)?,
            is_active: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}
