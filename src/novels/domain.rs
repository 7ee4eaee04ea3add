// Domain types - pure data, no side effects
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::models::NamedRef;
use crate::error::{AppError, AppResult};

/// Review status of a novel. Only `Approved` is publicly readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NovelStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl NovelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NovelStatus::Pending => "pending",
            NovelStatus::Approved => "approved",
            NovelStatus::Rejected => "rejected",
            NovelStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NovelStatus::Pending),
            "approved" => Some(NovelStatus::Approved),
            "rejected" => Some(NovelStatus::Rejected),
            "expired" => Some(NovelStatus::Expired),
            _ => None,
        }
    }
}

/// Whether chapters have been extracted from the blob. Orthogonal to review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsingStatus {
    Unparsed,
    Parsing,
    Parsed,
    Failed,
}

impl ParsingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParsingStatus::Unparsed => "unparsed",
            ParsingStatus::Parsing => "parsing",
            ParsingStatus::Parsed => "parsed",
            ParsingStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unparsed" => Some(ParsingStatus::Unparsed),
            "parsing" => Some(ParsingStatus::Parsing),
            "parsed" => Some(ParsingStatus::Parsed),
            "failed" => Some(ParsingStatus::Failed),
            _ => None,
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                <$ty>::parse(text).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{}'", stringify!($ty), text).into())
                })
            }
        }
    };
}

text_enum_sql!(NovelStatus);
text_enum_sql!(ParsingStatus);

/// A novel row. The blob key never leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Novel {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub protagonist: String,
    pub description: String,
    #[serde(skip)]
    pub blob_path: String,
    pub file_size: i64,
    pub word_count: i64,
    pub content_hash: String,
    pub uploader_id: i64,
    pub status: NovelStatus,
    pub parsing_status: ParsingStatus,
    pub click_count: i64,
    pub today_clicks: i64,
    pub week_clicks: i64,
    pub month_clicks: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Novel {
    pub const COLUMNS: &'static str = "id, title, author, protagonist, description, blob_path, \
         file_size, word_count, content_hash, uploader_id, status, parsing_status, click_count, \
         today_clicks, week_clicks, month_clicks, deleted_at, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            protagonist: row.get(3)?,
            description: row.get(4)?,
            blob_path: row.get(5)?,
            file_size: row.get(6)?,
            word_count: row.get(7)?,
            content_hash: row.get(8)?,
            uploader_id: row.get(9)?,
            status: row.get(10)?,
            parsing_status: row.get(11)?,
            click_count: row.get(12)?,
            today_clicks: row.get(13)?,
            week_clicks: row.get(14)?,
            month_clicks: row.get(15)?,
            deleted_at: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Novel header with its preloaded associations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelDetail {
    #[serde(flatten)]
    pub novel: Novel,
    pub uploader: NamedRef,
    pub categories: Vec<NamedRef>,
    pub keywords: Vec<NamedRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterHeader {
    pub id: i64,
    pub position: i64,
    pub title: String,
    pub word_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterBody {
    pub id: i64,
    pub novel_id: i64,
    pub position: i64,
    pub title: String,
    pub body: String,
    pub word_count: i64,
    pub prev_id: Option<i64>,
    pub next_id: Option<i64>,
}

/// Everything needed to persist a freshly uploaded novel.
#[derive(Debug, Clone, Default)]
pub struct NewNovel {
    pub title: String,
    pub author: String,
    pub protagonist: String,
    pub description: String,
    pub blob_path: String,
    pub file_size: i64,
    pub content_hash: String,
    pub uploader_id: i64,
    pub category_ids: Vec<i64>,
    pub keywords: Vec<String>,
}

/// Longest accepted search keyword, in characters.
pub const MAX_KEYWORD_CHARS: usize = 100;

/// Listing filters, already trimmed; empty strings are treated as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NovelFilter {
    pub title: Option<String>,
    pub author: Option<String>,
    pub category_id: Option<i64>,
    /// Matched against title, author, protagonist and description.
    pub keyword: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl NovelFilter {
    pub fn new(title: Option<String>, author: Option<String>, category_id: Option<i64>) -> Self {
        Self {
            title: clean(title),
            author: clean(author),
            category_id,
            ..Self::default()
        }
    }

    pub fn with_keyword(mut self, keyword: Option<String>) -> AppResult<Self> {
        let keyword = clean(keyword);
        if keyword
            .as_ref()
            .is_some_and(|k| k.chars().count() > MAX_KEYWORD_CHARS)
        {
            return Err(AppError::Validation(format!(
                "q must be at most {} characters",
                MAX_KEYWORD_CHARS
            )));
        }
        self.keyword = keyword;
        Ok(self)
    }

    /// Bounds on the average rating, inclusive. Unrated novels average 0.
    pub fn with_score_range(mut self, min: Option<f64>, max: Option<f64>) -> AppResult<Self> {
        for bound in [min, max].into_iter().flatten() {
            if !bound.is_finite() || !(0.0..=10.0).contains(&bound) {
                return Err(AppError::Validation(
                    "score bounds must be between 0 and 10".into(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(AppError::Validation("min_score exceeds max_score".into()));
            }
        }
        self.min_score = min;
        self.max_score = max;
        Ok(self)
    }

    /// Normalized `(name, value)` pairs for the listing cache fingerprint.
    pub fn fingerprint_parts(&self) -> Vec<(&'static str, String)> {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let number = |v: Option<f64>| v.map(|n| n.to_string()).unwrap_or_default();
        vec![
            ("title", text(&self.title)),
            ("author", text(&self.author)),
            (
                "category_id",
                self.category_id.map(|c| c.to_string()).unwrap_or_default(),
            ),
            ("q", text(&self.keyword)),
            ("min_score", number(self.min_score)),
            ("max_score", number(self.max_score)),
        ]
    }
}

/// Counter a ranking is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingKind {
    Today,
    Week,
    Month,
    Total,
}

impl RankingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RankingKind::Today => "today",
            RankingKind::Week => "week",
            RankingKind::Month => "month",
            RankingKind::Total => "total",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            RankingKind::Today => "today_clicks",
            RankingKind::Week => "week_clicks",
            RankingKind::Month => "month_clicks",
            RankingKind::Total => "click_count",
        }
    }
}

/// A matching title or a popular search, for type-ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    pub count: i64,
    pub source: SuggestionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionSource {
    Title,
    Search,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            NovelStatus::Pending,
            NovelStatus::Approved,
            NovelStatus::Rejected,
            NovelStatus::Expired,
        ] {
            assert_eq!(NovelStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ParsingStatus::parse("parsed"), Some(ParsingStatus::Parsed));
        assert_eq!(NovelStatus::parse("deleted"), None);
    }

    #[test]
    fn filter_drops_blank_values() {
        let filter = NovelFilter::new(Some("  ".into()), Some(" 金庸 ".into()), Some(3));
        assert_eq!(filter.title, None);
        assert_eq!(filter.author.as_deref(), Some("金庸"));

        let same = NovelFilter::new(None, Some("金庸".into()), Some(3));
        assert_eq!(filter.fingerprint_parts(), same.fingerprint_parts());

        let searched = same.clone().with_keyword(Some(" 江湖 ".into())).unwrap();
        assert_eq!(searched.keyword.as_deref(), Some("江湖"));
        assert_ne!(searched.fingerprint_parts(), same.fingerprint_parts());
        assert_eq!(same.clone().with_keyword(Some("  ".into())).unwrap(), same);
        assert!(NovelFilter::default()
            .with_keyword(Some("字".repeat(MAX_KEYWORD_CHARS + 1)))
            .is_err());
    }

    #[test]
    fn score_range_is_checked() {
        let range = |min, max| NovelFilter::default().with_score_range(min, max);
        assert!(range(Some(6.5), Some(9.0)).is_ok());
        assert!(range(None, Some(10.0)).is_ok());
        assert!(range(Some(9.0), Some(6.0)).is_err());
        assert!(range(Some(-1.0), None).is_err());
        assert!(range(None, Some(f64::NAN)).is_err());
    }

    #[test]
    fn blob_path_is_not_serialized() {
        let novel = Novel {
            id: 1,
            title: "T".into(),
            author: String::new(),
            protagonist: String::new(),
            description: String::new(),
            blob_path: "uploads/x.txt".into(),
            file_size: 4,
            word_count: 0,
            content_hash: "h".into(),
            uploader_id: 1,
            status: NovelStatus::Pending,
            parsing_status: ParsingStatus::Unparsed,
            click_count: 0,
            today_clicks: 0,
            week_clicks: 0,
            month_clicks: 0,
            deleted_at: None,
            created_at: "2024-01-01 00:00:00".into(),
            updated_at: "2024-01-01 00:00:00".into(),
        };
        let json = serde_json::to_value(&novel).unwrap();
        assert!(json.get("blob_path").is_none());
        assert_eq!(json["status"], "pending");
    }
}
