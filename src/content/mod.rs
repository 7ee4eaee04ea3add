//! Read side of novels: headers, listings, chapters and the raw file.
//!
//! Derived views go through the cache; the raw file is read from the blob
//! area, with whole bodies cached only for small files.

pub mod range;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::blob::BlobArea;
use crate::cache::{self, Cache, NOVEL_LIST_TAG};
use crate::clicks::ClickRecorder;
use crate::config::CacheConfig;
use crate::db;
use crate::envelope::{Page, PageQuery};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::novels::{
    ChapterBody, ChapterHeader, DynNovelRepository, Novel, NovelDetail, NovelFilter, NovelStatus,
    RankingKind, Suggestion,
};
use crate::parser::FileKind;

pub use range::RangeRequest;

pub const DEFAULT_RANKING_LIMIT: u32 = 10;
pub const MAX_RANKING_LIMIT: u32 = 100;
const HOT_KEYWORD_COUNT: u32 = 10;
const MAX_SUGGESTIONS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rankings {
    #[serde(rename = "type")]
    pub kind: RankingKind,
    pub limit: u32,
    pub novels: Vec<NovelDetail>,
}

/// Deleted novels do not exist; unapproved ones are visible to their
/// uploader and to administrators only.
pub fn ensure_readable(novel: &Novel, viewer: Option<&CurrentUser>) -> AppResult<()> {
    if novel.is_deleted() {
        return Err(AppError::NotFound("Novel".into()));
    }
    if novel.status == NovelStatus::Approved {
        return Ok(());
    }
    match viewer {
        Some(user) if user.is_admin || user.id == novel.uploader_id => Ok(()),
        _ => Err(AppError::Forbidden("novel is not published".into())),
    }
}

/// Raw file bytes ready to be sent, whole or as one range.
#[derive(Debug)]
pub struct RawStream {
    pub body: Bytes,
    pub size: u64,
    /// Inclusive range when answering 206.
    pub range: Option<(u64, u64)>,
    pub content_type: &'static str,
}

impl IntoResponse for RawStream {
    fn into_response(self) -> Response {
        let mut response = match self.range {
            Some((start, end)) => {
                let mut response = (StatusCode::PARTIAL_CONTENT, self.body).into_response();
                if let Ok(value) =
                    HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, self.size))
                {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                response
            }
            None => (StatusCode::OK, self.body).into_response(),
        };
        let headers = response.headers_mut();
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type),
        );
        response
    }
}

#[derive(Clone)]
pub struct ContentService {
    novels: DynNovelRepository,
    blobs: BlobArea,
    cache: Cache,
    clicks: ClickRecorder,
    ttl: CacheConfig,
}

fn secs(seconds: u64) -> Duration {
    Duration::from_secs(seconds)
}

impl ContentService {
    pub fn new(
        novels: DynNovelRepository,
        blobs: BlobArea,
        cache: Cache,
        clicks: ClickRecorder,
        ttl: CacheConfig,
    ) -> Self {
        Self {
            novels,
            blobs,
            cache,
            clicks,
            ttl,
        }
    }

    async fn cached_detail(&self, id: i64) -> AppResult<NovelDetail> {
        self.cache
            .get_or_load(
                &cache::novel_info_key(id),
                secs(self.ttl.info_ttl_secs),
                &[cache::novel_tag(id)],
                || async {
                    db::read_with_retry(|| self.novels.detail(id))
                        .await?
                        .ok_or_else(|| AppError::NotFound("Novel".into()))
                },
            )
            .await
    }

    pub async fn novel_info(
        &self,
        id: i64,
        viewer: Option<&CurrentUser>,
    ) -> AppResult<NovelDetail> {
        let detail = self.cached_detail(id).await?;
        ensure_readable(&detail.novel, viewer)?;
        Ok(detail)
    }

    /// Approved novels matching `filter`. A keyword search on the first page
    /// counts toward the hot keywords.
    pub async fn list_novels(
        &self,
        filter: NovelFilter,
        page: PageQuery,
    ) -> AppResult<Page<NovelDetail>> {
        let page = page.normalized();
        if let (Some(keyword), 1) = (filter.keyword.as_deref(), page.page) {
            if let Err(e) = self.novels.record_search(keyword).await {
                tracing::warn!(keyword, error = %e, "search not recorded");
            }
        }
        let mut parts = filter.fingerprint_parts();
        parts.push(("page", page.page.to_string()));
        parts.push(("limit", page.limit.to_string()));
        let key = cache::novel_list_key(&cache::fingerprint(&parts));

        self.cache
            .get_or_load(
                &key,
                secs(self.ttl.list_ttl_secs),
                &[NOVEL_LIST_TAG.to_string()],
                || async {
                    let (items, total) = db::read_with_retry(|| {
                        self.novels.list_approved(&filter, page.page, page.limit)
                    })
                    .await?;
                    Ok(Page {
                        items,
                        total,
                        page: page.page,
                        limit: page.limit,
                    })
                },
            )
            .await
    }

    pub async fn rankings(
        &self,
        kind: RankingKind,
        category_id: Option<i64>,
        limit: Option<u32>,
    ) -> AppResult<Rankings> {
        let limit = limit
            .unwrap_or(DEFAULT_RANKING_LIMIT)
            .clamp(1, MAX_RANKING_LIMIT);
        self.cache
            .get_or_load(
                &cache::rankings_key(kind.as_str(), category_id, limit),
                secs(self.ttl.list_ttl_secs),
                &[NOVEL_LIST_TAG.to_string()],
                || async {
                    let novels =
                        db::read_with_retry(|| self.novels.rankings(kind, category_id, limit))
                            .await?;
                    Ok(Rankings {
                        kind,
                        limit,
                        novels,
                    })
                },
            )
            .await
    }

    pub async fn hot_keywords(&self) -> AppResult<Vec<String>> {
        self.cache
            .get_or_load(
                &cache::hot_keywords_key(HOT_KEYWORD_COUNT),
                secs(self.ttl.list_ttl_secs),
                &[NOVEL_LIST_TAG.to_string()],
                || db::read_with_retry(|| self.novels.hot_keywords(HOT_KEYWORD_COUNT)),
            )
            .await
    }

    /// Type-ahead for a partial keyword. Blank input suggests nothing.
    pub async fn suggestions(&self, keyword: Option<&str>) -> AppResult<Vec<Suggestion>> {
        let keyword = keyword.map(str::trim).unwrap_or_default();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }
        let keyword: String = keyword
            .chars()
            .take(crate::novels::domain::MAX_KEYWORD_CHARS)
            .collect();
        db::read_with_retry(|| self.novels.suggestions(&keyword, MAX_SUGGESTIONS)).await
    }

    /// The uploader's own novels in every status. Not cached.
    pub async fn list_mine(
        &self,
        user: &CurrentUser,
        page: PageQuery,
    ) -> AppResult<Page<NovelDetail>> {
        let page = page.normalized();
        let (items, total) =
            db::read_with_retry(|| self.novels.list_by_uploader(user.id, page.page, page.limit))
                .await?;
        Ok(Page {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    pub async fn list_chapters(
        &self,
        novel_id: i64,
        viewer: Option<&CurrentUser>,
    ) -> AppResult<Vec<ChapterHeader>> {
        self.novel_info(novel_id, viewer).await?;
        self.cache
            .get_or_load(
                &cache::novel_chapters_key(novel_id),
                secs(self.ttl.chapters_ttl_secs),
                &[cache::novel_tag(novel_id)],
                || db::read_with_retry(|| self.novels.chapter_headers(novel_id)),
            )
            .await
    }

    /// Fetch one chapter and count a click for its novel. `novel_id`, when
    /// given, must own the chapter.
    pub async fn get_chapter(
        &self,
        novel_id: Option<i64>,
        chapter_id: i64,
        viewer: Option<&CurrentUser>,
    ) -> AppResult<ChapterBody> {
        let key = cache::chapter_key(chapter_id);
        let chapter = match self.cache.get_json::<ChapterBody>(&key) {
            Some(hit) => hit,
            None => {
                let loaded = db::read_with_retry(|| self.novels.chapter(chapter_id))
                    .await?
                    .ok_or_else(|| AppError::NotFound("Chapter".into()))?;
                self.cache.set_json(
                    &key,
                    &loaded,
                    secs(self.ttl.chapter_ttl_secs),
                    &[cache::novel_tag(loaded.novel_id)],
                );
                loaded
            }
        };

        if novel_id.is_some_and(|id| id != chapter.novel_id) {
            return Err(AppError::NotFound("Chapter".into()));
        }
        self.novel_info(chapter.novel_id, viewer).await?;
        self.clicks.record(chapter.novel_id);
        Ok(chapter)
    }

    /// Count a click on an approved novel.
    pub async fn record_click(&self, novel_id: i64) -> AppResult<()> {
        let detail = self.cached_detail(novel_id).await?;
        if detail.novel.is_deleted() || detail.novel.status != NovelStatus::Approved {
            return Err(AppError::NotFound("Novel".into()));
        }
        self.clicks.record(novel_id);
        Ok(())
    }

    pub async fn stream(
        &self,
        novel_id: i64,
        range_header: Option<&str>,
        viewer: Option<&CurrentUser>,
    ) -> AppResult<RawStream> {
        let novel = db::read_with_retry(|| self.novels.get(novel_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Novel".into()))?;
        ensure_readable(&novel, viewer)?;

        let content_type = novel
            .blob_path
            .rsplit_once('.')
            .and_then(|(_, ext)| FileKind::from_extension(ext))
            .map(FileKind::content_type)
            .unwrap_or("application/octet-stream");

        let size = self.blobs.size(&novel.blob_path).await?;
        let request = range::resolve(range_header, size);
        if request == RangeRequest::Unsatisfiable {
            return Err(AppError::RangeUnsatisfiable { size });
        }

        let whole = if size <= self.ttl.content_max_bytes {
            Some(self.small_file(&novel, size).await?)
        } else {
            None
        };

        let (body, range) = match (request, whole) {
            (RangeRequest::Partial { start, end }, Some(whole)) => {
                (whole.slice(start as usize..=end as usize), Some((start, end)))
            }
            (RangeRequest::Partial { start, end }, None) => (
                self.blobs.read_range(&novel.blob_path, start, end).await?,
                Some((start, end)),
            ),
            (_, Some(whole)) => (whole, None),
            (_, None) => (self.blobs.read(&novel.blob_path).await?, None),
        };

        Ok(RawStream {
            body,
            size,
            range,
            content_type,
        })
    }

    async fn small_file(&self, novel: &Novel, size: u64) -> AppResult<Bytes> {
        let key = cache::novel_content_key(novel.id);
        if let Some(hit) = self.cache.get_bytes(&key) {
            if hit.len() as u64 == size {
                return Ok(hit);
            }
        }
        let bytes = self.blobs.read(&novel.blob_path).await?;
        self.cache.set_bytes(
            &key,
            bytes.clone(),
            secs(self.ttl.content_ttl_secs),
            &[cache::novel_tag(novel.id)],
        );
        Ok(bytes)
    }
}
