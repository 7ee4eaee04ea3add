use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;

use crate::envelope::{Envelope, Page, PageQuery};
use crate::error::AppResult;
use crate::extractors::{CurrentUser, JsonBody, MaybeUser, QueryParams};
use crate::social::{
    Comment, CommentInput, HistoryEntry, LikeState, LikeTarget, ProgressInput, Rating,
    RatingInput, RatingSummary, ReadingProgress,
};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/novels/{id}/ratings", get(ratings).post(rate))
        .route("/novels/{id}/comments", get(comments).post(comment))
        .route("/novels/{id}/progress", get(progress).put(save_progress))
        .route("/comments/{id}/like", post(like_comment).delete(unlike_comment))
        .route("/ratings/{id}/like", post(like_rating).delete(unlike_rating))
        .route("/users/me/history", get(history))
}

async fn rate(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    JsonBody(input): JsonBody<RatingInput>,
) -> AppResult<Envelope<Rating>> {
    Ok(Envelope::ok(state.social.rate(&user, id, &input)?))
}

async fn ratings(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<i64>,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<RatingSummary>> {
    Ok(Envelope::ok(state.social.ratings(id, viewer.as_ref(), page)?))
}

async fn comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    JsonBody(input): JsonBody<CommentInput>,
) -> AppResult<Envelope<Comment>> {
    Ok(Envelope::ok(state.social.comment(&user, id, &input)?))
}

async fn comments(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    Path(id): Path<i64>,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<Page<Comment>>> {
    Ok(Envelope::ok(state.social.comments(id, viewer.as_ref(), page)?))
}

async fn save_progress(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    JsonBody(input): JsonBody<ProgressInput>,
) -> AppResult<Envelope<ReadingProgress>> {
    Ok(Envelope::ok(state.social.save_progress(&user, id, &input)?))
}

async fn progress(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<ReadingProgress>> {
    Ok(Envelope::ok(state.social.progress(&user, id)?))
}

async fn history(
    State(state): State<AppState>,
    user: CurrentUser,
    QueryParams(page): QueryParams<PageQuery>,
) -> AppResult<Envelope<Page<HistoryEntry>>> {
    Ok(Envelope::ok(state.social.history(&user, page)?))
}

async fn like_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<LikeState>> {
    Ok(Envelope::ok(state.social.set_like(&user, LikeTarget::Comment, id, true)?))
}

async fn unlike_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<LikeState>> {
    Ok(Envelope::ok(state.social.set_like(&user, LikeTarget::Comment, id, false)?))
}

async fn like_rating(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<LikeState>> {
    Ok(Envelope::ok(state.social.set_like(&user, LikeTarget::Rating, id, true)?))
}

async fn unlike_rating(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> AppResult<Envelope<LikeState>> {
    Ok(Envelope::ok(state.social.set_like(&user, LikeTarget::Rating, id, false)?))
}
