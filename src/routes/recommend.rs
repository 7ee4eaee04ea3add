use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::envelope::Envelope;
use crate::error::AppResult;
use crate::extractors::{MaybeUser, QueryParams};
use crate::recommend::{RecommendKind, Recommendation};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RecommendQuery {
    #[serde(rename = "type")]
    pub kind: Option<RecommendKind>,
    pub novel_id: Option<i64>,
    pub limit: Option<u32>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/recommendations", get(rank))
        .route("/recommendations/personalized", get(personalized))
}

async fn rank(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<RecommendQuery>,
) -> AppResult<Envelope<Vec<Recommendation>>> {
    let limit = state.recommender.clamp_limit(query.limit);
    let kind = query.kind.unwrap_or(RecommendKind::Hot);
    let items = state.recommender.rank(kind, query.novel_id, limit).await?;
    Ok(Envelope::ok(items))
}

async fn personalized(
    State(state): State<AppState>,
    MaybeUser(viewer): MaybeUser,
    QueryParams(query): QueryParams<RecommendQuery>,
) -> AppResult<Envelope<Vec<Recommendation>>> {
    let limit = state.recommender.clamp_limit(query.limit);
    let items = state
        .recommender
        .personalized(viewer.map(|u| u.id), limit)
        .await?;
    Ok(Envelope::ok(items))
}
