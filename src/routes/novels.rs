use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;

use crate::content::{Rankings, RawStream};
use crate::db::models::Category;
use crate::envelope::{Envelope, Page, PageQuery};
use crate::error::{AppError, AppResult};
use crate::extractors::{ClientInfo, CurrentUser, MaybeUser, QueryParams};
use crate::ingest::{parse_id_list, parse_keywords, UploadRequest};
use crate::novels::{
    ChapterBody, ChapterHeader, NovelDetail, NovelFilter, RankingKind, Suggestion,
};
use crate::review::ContentKind;
use crate::state::AppState;

/// Headroom over the file limit for the other multipart fields.
const FORM_OVERHEAD: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub title: Option<String>,
    pub author: Option<String>,
    pub category_id: Option<i64>,
    pub q: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RankingQuery {
    #[serde(rename = "type")]
    pub kind: Option<RankingKind>,
    pub category_id: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SuggestQuery {
    pub q: Option<String>,
}

pub fn router(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes + FORM_OVERHEAD).unwrap_or(usize::MAX);
    Router::new()
        .route(
            "/novels/upload",
            post(upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/novels", get(list))
        .route("/novels/mine", get(mine))
        .route("/novels/{id}", get(info).delete(remove))
        .route("/novels/{id}/chapters", get(chapters))
        .route("/novels/{id}/chapters/{chapter_id}", get(novel_chapter))
        .route("/chapters/{chapter_id}", get(chapter))
        .route("/novels/{id}/content-stream", get(stream))
        .route("/novels/{id}/click", post(click))
        .route("/categories", get(categories))
        .route("/rankings", get(rankings))
        .route("/search/hot-keywords", get(hot_keywords))
        .route("/search/suggestions", get(suggestions))
}

fn multipart_error(err: MultipartError, limit: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::TooLarge { limit }
    } else {
        AppError::Validation(err.body_text())
    }
}

async fn upload(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientInfo,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Envelope<NovelDetail>> {
    let limit = state.ingest.max_bytes();
    let mut multipart = multipart.map_err(|e| AppError::Validation(e.body_text()))?;

    let mut file: Option<(String, Bytes)> = None;
    let mut request = UploadRequest::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
            file = Some((filename, data));
            continue;
        }

        let value = field.text().await.map_err(|e| multipart_error(e, limit))?;
        match name.as_str() {
            "title" => request.title = value,
            "author" => request.author = value,
            "protagonist" => request.protagonist = value,
            "description" => request.description = value,
            "category_ids" => request.category_ids = parse_id_list(&value)?,
            "keywords" => request.keywords = parse_keywords(&value)?,
            _ => tracing::debug!(field = %name, "ignoring unknown upload field"),
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| AppError::Validation("file field is required".into()))?;
    request.filename = filename;
    request.bytes = bytes;

    let detail = state.ingest.upload(&user, &client, request).await?;
    Ok(Envelope::with_message(detail, "uploaded, waiting for review"))
}

async fn list(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> AppResult<Envelope<Page<NovelDetail>>> {
    let filter = NovelFilter::new(query.title, query.author, query.category_id)
        .with_keyword(query.q)?
        .with_score_range(query.min_score, query.max_score)?;
    let page = state
        .content
        .list_novels(filter, PageQuery::from_parts(query.page, query.limit))
        .await?;
    Ok(Envelope::ok(page))
}

async fn mine(
    State(state): State<AppState>,
    user: CurrentUser,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<Page<NovelDetail>>> {
    Ok(Envelope::ok(state.content.list_mine(&user, page).await?))
}

async fn info(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<NovelDetail>> {
    Ok(Envelope::ok(state.content.novel_info(id, viewer.as_ref()).await?))
}

/// Uploaders withdraw their own novels; administrators go through the
/// audited content deletion.
async fn remove(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> AppResult<Envelope<()>> {
    let novel = state
        .novels
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Novel".into()))?;

    if novel.uploader_id == user.id {
        state.ingest.withdraw(&user, &client, id).await?;
    } else if user.is_admin {
        state
            .review
            .delete_content(&user, ContentKind::Novel, id, "removed by administrator")
            .await?;
    } else {
        return Err(AppError::Forbidden("only the uploader or an administrator can delete".into()));
    }
    Ok(Envelope::with_message((), "deleted"))
}

async fn chapters(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<Vec<ChapterHeader>>> {
    Ok(Envelope::ok(state.content.list_chapters(id, viewer.as_ref()).await?))
}

async fn novel_chapter(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path((id, chapter_id)): Path<(i64, i64)>,
) -> AppResult<Envelope<ChapterBody>> {
    let body = state
        .content
        .get_chapter(Some(id), chapter_id, viewer.as_ref())
        .await?;
    Ok(Envelope::ok(body))
}

async fn chapter(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(chapter_id): Path<i64>,
) -> AppResult<Envelope<ChapterBody>> {
    let body = state
        .content
        .get_chapter(None, chapter_id, viewer.as_ref())
        .await?;
    Ok(Envelope::ok(body))
}

async fn stream(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> AppResult<RawStream> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    state.content.stream(id, range, viewer.as_ref()).await
}

async fn click(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Envelope<()>> {
    state.content.record_click(id).await?;
    Ok(Envelope::ok(()))
}

async fn rankings(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<RankingQuery>,
) -> AppResult<Envelope<Rankings>> {
    let kind = query.kind.unwrap_or(RankingKind::Total);
    let rankings = state
        .content
        .rankings(kind, query.category_id, query.limit)
        .await?;
    Ok(Envelope::ok(rankings))
}

async fn hot_keywords(State(state): State<AppState>) -> AppResult<Envelope<Vec<String>>> {
    Ok(Envelope::ok(state.content.hot_keywords().await?))
}

async fn suggestions(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<SuggestQuery>,
) -> AppResult<Envelope<Vec<Suggestion>>> {
    Ok(Envelope::ok(state.content.suggestions(query.q.as_deref()).await?))
}

async fn categories(State(state): State<AppState>) -> AppResult<Envelope<Vec<Category>>> {
    Ok(Envelope::ok(state.novels.categories().await?))
}
