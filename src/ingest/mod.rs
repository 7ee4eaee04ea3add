//! Upload → stored novel pipeline.
//!
//! Everything before the insert transaction commits is undoable: a failed
//! insert removes the blob this upload wrote. Parsing happens afterwards on
//! the worker pool in [`queue`].

pub mod queue;

use bytes::Bytes;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::activity::{ActivityEntry, ActivityRecorder};
use crate::blob::BlobArea;
use crate::cache::Cache;
use crate::config::UploadConfig;
use crate::error::AppError;
use crate::extractors::{ClientInfo, CurrentUser};
use crate::novels::{DynNovelRepository, NewNovel, NovelDetail};
use crate::parser::FileKind;

pub use queue::{ParseJobs, ParseQueue, ParseWorkerPool};

const MAX_TITLE_CHARS: usize = 200;
const MAX_FIELD_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 5000;
const MAX_KEYWORD_CHARS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("only .txt and .epub files are accepted")]
    Unsupported,

    #[error("file exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("upload limit reached, try again later")]
    RateLimited,

    #[error("this file has already been uploaded")]
    Duplicate,

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("parse queue is full")]
    ParseQueueFull,

    #[error("parse queue is closed")]
    ParseQueueClosed,

    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Unsupported | IngestError::Invalid(_) => {
                AppError::Validation(err.to_string())
            }
            IngestError::TooLarge { limit } => AppError::TooLarge { limit },
            IngestError::RateLimited => AppError::RateLimited,
            IngestError::Duplicate => AppError::StateConflict(err.to_string()),
            IngestError::Forbidden(reason) => AppError::Forbidden(reason),
            IngestError::ParseQueueFull | IngestError::ParseQueueClosed => {
                AppError::Internal(err.to_string())
            }
            IngestError::Store(inner) => inner,
        }
    }
}

/// A multipart upload after the form has been read.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub filename: String,
    pub bytes: Bytes,
    pub title: String,
    pub author: String,
    pub protagonist: String,
    pub description: String,
    pub category_ids: Vec<i64>,
    pub keywords: Vec<String>,
}

/// Parse a comma-separated id list such as `"1, 2,3"`.
pub fn parse_id_list(raw: &str) -> Result<Vec<i64>, IngestError> {
    let mut ids = Vec::new();
    for part in raw.split([',', '，']).map(str::trim).filter(|p| !p.is_empty()) {
        let id = part
            .parse::<i64>()
            .map_err(|_| IngestError::Invalid(format!("invalid category id '{}'", part)))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Split, trim and dedupe a comma-separated keyword list.
pub fn parse_keywords(raw: &str) -> Result<Vec<String>, IngestError> {
    let mut words: Vec<String> = Vec::new();
    for word in raw.split([',', '，']).map(str::trim).filter(|w| !w.is_empty()) {
        if word.chars().count() > MAX_KEYWORD_CHARS {
            return Err(IngestError::Invalid(format!(
                "keyword '{}' is longer than {} characters",
                word, MAX_KEYWORD_CHARS
            )));
        }
        if !words.iter().any(|w| w == word) {
            words.push(word.to_string());
        }
    }
    Ok(words)
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), IngestError> {
    if value.chars().count() > max {
        return Err(IngestError::Invalid(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

/// Remove the blob at `key` unless a live novel other than `except_id`
/// still references it. Failures are logged; the row is already gone.
pub async fn release_blob(novels: &DynNovelRepository, blobs: &BlobArea, key: &str, except_id: i64) {
    match novels.blob_in_use(key, except_id).await {
        Ok(false) => {
            if let Err(e) = blobs.delete(key).await {
                tracing::warn!(key, error = %e, "failed to remove blob");
            }
        }
        Ok(true) => tracing::debug!(key, "blob still referenced, kept"),
        Err(e) => tracing::warn!(key, error = %e, "could not check blob references"),
    }
}

#[derive(Clone)]
pub struct IngestService {
    novels: DynNovelRepository,
    blobs: BlobArea,
    queue: ParseQueue,
    cache: Cache,
    activity: ActivityRecorder,
    config: UploadConfig,
}

impl IngestService {
    pub fn new(
        novels: DynNovelRepository,
        blobs: BlobArea,
        queue: ParseQueue,
        cache: Cache,
        activity: ActivityRecorder,
        config: UploadConfig,
    ) -> Self {
        Self {
            novels,
            blobs,
            queue,
            cache,
            activity,
            config,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    pub async fn upload(
        &self,
        user: &CurrentUser,
        client: &ClientInfo,
        request: UploadRequest,
    ) -> Result<NovelDetail, IngestError> {
        if !user.is_activated {
            return Err(IngestError::Forbidden("account is not activated".into()));
        }

        let kind = FileKind::from_filename(&request.filename).ok_or(IngestError::Unsupported)?;
        if request.bytes.len() as u64 > self.config.max_bytes {
            return Err(IngestError::TooLarge {
                limit: self.config.max_bytes,
            });
        }
        if request.bytes.is_empty() {
            return Err(IngestError::Invalid("file is empty".into()));
        }

        let title = request.title.trim().to_string();
        if title.is_empty() {
            return Err(IngestError::Invalid("title is required".into()));
        }
        check_len("title", &title, MAX_TITLE_CHARS)?;
        check_len("author", request.author.trim(), MAX_FIELD_CHARS)?;
        check_len("protagonist", request.protagonist.trim(), MAX_FIELD_CHARS)?;
        check_len("description", request.description.trim(), MAX_DESCRIPTION_CHARS)?;

        if !user.is_admin {
            let since = Utc::now() - Duration::hours(self.config.rate_limit_window_hours);
            let recent = self.novels.count_uploads_since(user.id, since).await?;
            if recent >= i64::from(self.config.rate_limit_count) {
                tracing::info!(user_id = user.id, recent, "upload rate limit reached");
                return Err(IngestError::RateLimited);
            }
        }

        let hash = content_hash(&request.bytes);
        if self.novels.find_live_by_hash(&hash).await?.is_some() {
            return Err(IngestError::Duplicate);
        }

        let key = BlobArea::key_for(&hash, kind.extension());
        let created = self.blobs.put_if_absent(&key, &request.bytes).await?;

        let new_novel = NewNovel {
            title,
            author: request.author.trim().to_string(),
            protagonist: request.protagonist.trim().to_string(),
            description: request.description.trim().to_string(),
            blob_path: key.clone(),
            file_size: request.bytes.len() as i64,
            content_hash: hash,
            uploader_id: user.id,
            category_ids: request.category_ids,
            keywords: request.keywords,
        };

        let id = match self.novels.insert(&new_novel).await {
            Ok(id) => id,
            Err(err) => {
                if created {
                    self.discard_blob(&key).await;
                }
                return Err(match err {
                    AppError::StateConflict(_) => IngestError::Duplicate,
                    other => other.into(),
                });
            }
        };

        tracing::info!(novel_id = id, user_id = user.id, size = new_novel.file_size, "novel uploaded");
        self.activity.record(
            ActivityEntry::new(user.id, "upload_novel", true)
                .detail(format!("novel {} ({})", id, new_novel.title))
                .client(&client.ip, &client.user_agent),
        );

        if let Err(e) = self.queue.try_enqueue(id) {
            tracing::warn!(novel_id = id, error = %e, "parse not scheduled, will retry on restart");
        }

        self.novels
            .detail(id)
            .await?
            .ok_or_else(|| IngestError::Store(AppError::NotFound("Novel".into())))
    }

    /// Tombstone the caller's own novel. Deleting twice is a no-op.
    pub async fn withdraw(
        &self,
        user: &CurrentUser,
        client: &ClientInfo,
        novel_id: i64,
    ) -> Result<(), IngestError> {
        let novel = self
            .novels
            .get(novel_id)
            .await?
            .ok_or_else(|| IngestError::Store(AppError::NotFound("Novel".into())))?;
        if novel.uploader_id != user.id {
            return Err(IngestError::Forbidden("only the uploader can withdraw a novel".into()));
        }
        if !self.novels.soft_delete(novel_id).await? {
            return Ok(());
        }

        tracing::info!(novel_id, user_id = user.id, "novel withdrawn by uploader");
        self.cache.invalidate_novel(novel_id);
        release_blob(&self.novels, &self.blobs, &novel.blob_path, novel_id).await;
        self.activity.record(
            ActivityEntry::new(user.id, "delete_novel", true)
                .detail(format!("novel {} ({})", novel_id, novel.title))
                .client(&client.ip, &client.user_agent),
        );
        Ok(())
    }

    /// Remove a blob this upload wrote, unless a concurrent upload of the same
    /// bytes now references it.
    async fn discard_blob(&self, key: &str) {
        release_blob(&self.novels, &self.blobs, key, 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_lists_accept_both_comma_styles() {
        assert_eq!(parse_id_list("1, 2，3,,2").unwrap(), vec![1, 2, 3]);
        assert!(parse_id_list("").unwrap().is_empty());
        assert!(matches!(parse_id_list("1,x"), Err(IngestError::Invalid(_))));
    }

    #[test]
    fn keywords_are_trimmed_and_deduplicated() {
        assert_eq!(
            parse_keywords(" 江湖 ,复仇，江湖, ").unwrap(),
            vec!["江湖".to_string(), "复仇".to_string()]
        );
        let long = "字".repeat(MAX_KEYWORD_CHARS + 1);
        assert!(parse_keywords(&long).is_err());
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"AAAA"),
            "63c1dd951ffedf6f7fd968ad4efa39b8ed584f162f46e715114ee184f8de9201"
        );
    }

    #[test]
    fn errors_map_onto_envelope_kinds() {
        use axum::http::StatusCode;
        let status = |e: IngestError| AppError::from(e).status();
        assert_eq!(status(IngestError::Unsupported), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(IngestError::TooLarge { limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(status(IngestError::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status(IngestError::Duplicate), StatusCode::CONFLICT);
    }
}
