use axum::extract::{Path, State};
use axum::routing::{delete, get, post, put};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::accounts::{self, UserStatus};
use crate::db::models::{AdminLog, Category, ReviewCriterion, SystemMessage, User, UserActivity};
use crate::envelope::{Envelope, Page, PageQuery};
use crate::error::AppResult;
use crate::extractors::{AdminUser, JsonBody, QueryParams};
use crate::novels::NovelDetail;
use crate::review::{BatchOutcome, ContentKind, CriterionInput, LogFilter, Transition};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct BatchBody {
    pub ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct DeleteContentBody {
    pub kind: ContentKind,
    pub id: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct CategoryBody {
    pub name: String,
    pub parent_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct MessageBody {
    pub title: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct LogQuery {
    pub admin_id: Option<i64>,
    pub action: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub user_id: Option<i64>,
    pub action: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct UserListQuery {
    pub status: Option<UserStatus>,
    pub q: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct TransitionData {
    pub id: i64,
    pub result: Transition,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/novels/pending", get(pending))
        .route("/novels/{id}/approve", post(approve))
        .route("/novels/{id}/reject", post(reject))
        .route("/novels/batch-approve", post(batch_approve))
        .route("/admin/novels/{id}/reparse", post(reparse))
        .route("/admin/novels/expire", post(expire))
        .route("/admin/content/delete", post(delete_content))
        .route("/admin/users", get(users))
        .route("/admin/users/{id}/freeze", post(freeze))
        .route("/admin/users/{id}/unfreeze", post(unfreeze))
        .route("/admin/logs", get(logs))
        .route("/admin/activities", get(activities))
        .route("/admin/categories", post(create_category))
        .route("/admin/messages", get(list_messages).post(create_message))
        .route("/admin/messages/{id}/publish", post(publish_message))
        .route("/admin/messages/{id}", delete(delete_message))
        .route("/admin/criteria", get(list_criteria).post(create_criterion))
        .route("/admin/criteria/{id}", put(update_criterion).delete(delete_criterion))
        .route("/messages", get(published_messages))
}

fn page_of<T>(items: Vec<T>, total: i64, page: PageQuery) -> Page<T> {
    Page {
        items,
        total,
        page: page.page,
        limit: page.limit,
    }
}

async fn pending(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<Page<NovelDetail>>> {
    Ok(Envelope::ok(state.review.list_pending(page).await?))
}

async fn approve(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<TransitionData>> {
    let result = state.review.approve(&admin, id).await?;
    Ok(Envelope::ok(TransitionData { id, result }))
}

async fn reject(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    JsonBody(body): JsonBody<ReasonBody>,
) -> AppResult<Envelope<TransitionData>> {
    let result = state.review.reject(&admin, id, &body.reason).await?;
    Ok(Envelope::ok(TransitionData { id, result }))
}

async fn batch_approve(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    JsonBody(body): JsonBody<BatchBody>,
) -> AppResult<Envelope<BatchOutcome>> {
    Ok(Envelope::ok(state.review.batch_approve(&admin, &body.ids).await?))
}

async fn reparse(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<()>> {
    state.review.reparse(&admin, id).await?;
    Ok(Envelope::with_message((), "reparse scheduled"))
}

async fn expire(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> AppResult<Envelope<Value>> {
    let expired = state.review.sweep(Utc::now()).await?;
    Ok(Envelope::ok(json!({ "expired_count": expired })))
}

async fn delete_content(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    JsonBody(body): JsonBody<DeleteContentBody>,
) -> AppResult<Envelope<TransitionData>> {
    let result = state
        .review
        .delete_content(&admin, body.kind, body.id, &body.reason)
        .await?;
    Ok(Envelope::ok(TransitionData { id: body.id, result }))
}

async fn users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    QueryParams(query): QueryParams<UserListQuery>,
) -> AppResult<Envelope<Page<User>>> {
    let page = PageQuery::from_parts(query.page, query.limit).normalized();
    let (items, total) = accounts::list_users(
        &state.db,
        query.status.unwrap_or(UserStatus::All),
        query.q.as_deref(),
        page.page,
        page.limit,
    )?;
    Ok(Envelope::ok(page_of(items, total, page)))
}

async fn freeze(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<TransitionData>> {
    let result = state.review.set_user_frozen(&admin, id, true).await?;
    Ok(Envelope::ok(TransitionData { id, result }))
}

async fn unfreeze(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<TransitionData>> {
    let result = state.review.set_user_frozen(&admin, id, false).await?;
    Ok(Envelope::ok(TransitionData { id, result }))
}

async fn logs(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    QueryParams(query): QueryParams<LogQuery>,
) -> AppResult<Envelope<Page<AdminLog>>> {
    let filter = LogFilter {
        admin_id: query.admin_id,
        action: query.action.filter(|a| !a.trim().is_empty()),
    };
    let page = PageQuery::from_parts(query.page, query.limit);
    Ok(Envelope::ok(state.review.logs(filter, page).await?))
}

async fn activities(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    QueryParams(query): QueryParams<ActivityQuery>,
) -> AppResult<Envelope<Page<UserActivity>>> {
    let page = PageQuery::from_parts(query.page, query.limit).normalized();
    let action = query.action.as_deref().filter(|a| !a.trim().is_empty());
    let (items, total) = state
        .activity
        .list(query.user_id, action, page.page, page.limit)?;
    Ok(Envelope::ok(page_of(items, total, page)))
}

async fn create_category(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    JsonBody(body): JsonBody<CategoryBody>,
) -> AppResult<Envelope<Category>> {
    let category = state
        .catalog
        .create_category(admin.id, &body.name, body.parent_id)?;
    Ok(Envelope::ok(category))
}

async fn list_messages(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<Page<SystemMessage>>> {
    let page = page.normalized();
    let (items, total) = state.catalog.list_messages(false, page.page, page.limit)?;
    Ok(Envelope::ok(page_of(items, total, page)))
}

async fn published_messages(
    State(state): State<AppState>,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<Page<SystemMessage>>> {
    let page = page.normalized();
    let (items, total) = state.catalog.list_messages(true, page.page, page.limit)?;
    Ok(Envelope::ok(page_of(items, total, page)))
}

async fn create_message(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    JsonBody(body): JsonBody<MessageBody>,
) -> AppResult<Envelope<SystemMessage>> {
    let message = state
        .catalog
        .create_message(admin.id, &body.title, &body.content)?;
    Ok(Envelope::ok(message))
}

async fn publish_message(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<()>> {
    state.catalog.publish_message(admin.id, id)?;
    Ok(Envelope::with_message((), "published"))
}

async fn delete_message(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<()>> {
    state.catalog.delete_message(admin.id, id)?;
    Ok(Envelope::with_message((), "deleted"))
}

async fn list_criteria(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> AppResult<Envelope<Vec<ReviewCriterion>>> {
    Ok(Envelope::ok(state.catalog.list_criteria()?))
}

async fn create_criterion(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    JsonBody(input): JsonBody<CriterionInput>,
) -> AppResult<Envelope<ReviewCriterion>> {
    Ok(Envelope::ok(state.catalog.create_criterion(admin.id, &input)?))
}

async fn update_criterion(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    JsonBody(input): JsonBody<CriterionInput>,
) -> AppResult<Envelope<ReviewCriterion>> {
    Ok(Envelope::ok(state.catalog.update_criterion(admin.id, id, &input)?))
}

async fn delete_criterion(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<()>> {
    state.catalog.delete_criterion(admin.id, id)?;
    Ok(Envelope::with_message((), "deleted"))
}
