//! Rankings: hot, new, random, similar-to-a-novel and personalized.
//!
//! Similar and personalized scoring only looks at a candidate set: the most
//! clicked approved novels sharing something with the seed or profile.

pub mod repository;
pub mod similarity;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::cache::{Cache, RECOMMEND_TAG};
use crate::config::RecommendConfig;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::novels::NovelDetail;

pub use repository::{
    Candidate, DynRecommendRepository, ReaderProfile, RecommendRepository,
    SqliteRecommendRepository,
};
pub use similarity::{freshness, jaccard, similarity, Features, Scored};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendKind {
    #[serde(alias = "popular")]
    Hot,
    New,
    Random,
    Similar,
}

impl RecommendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendKind::Hot => "hot",
            RecommendKind::New => "new",
            RecommendKind::Random => "random",
            RecommendKind::Similar => "similar",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(flatten)]
    pub detail: NovelDetail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Recommendation {
    fn unscored(detail: NovelDetail) -> Self {
        Self { detail, score: None }
    }
}

fn cache_key(op: &str, key: i64, limit: usize) -> String {
    format!("recommend:{}:{}:{}", op, key, limit)
}

#[derive(Clone)]
pub struct Recommender {
    repo: DynRecommendRepository,
    cache: Cache,
    ttl: Duration,
    config: RecommendConfig,
}

impl Recommender {
    pub fn new(
        repo: DynRecommendRepository,
        cache: Cache,
        ttl: Duration,
        config: RecommendConfig,
    ) -> Self {
        Self {
            repo,
            cache,
            ttl,
            config,
        }
    }

    pub fn clamp_limit(&self, requested: Option<u32>) -> usize {
        requested
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit.max(1)) as usize
    }

    /// Dispatch a `type=` ranking. `similar` needs a seed novel.
    pub async fn rank(
        &self,
        kind: RecommendKind,
        novel_id: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Recommendation>> {
        match kind {
            RecommendKind::Hot => self.hot(limit).await,
            RecommendKind::New => self.newest(limit).await,
            RecommendKind::Random => self.random(limit).await,
            RecommendKind::Similar => {
                let id = novel_id.ok_or_else(|| {
                    AppError::Validation("novel_id is required for similar".into())
                })?;
                self.similar(id, limit).await
            }
        }
    }

    pub async fn hot(&self, limit: usize) -> AppResult<Vec<Recommendation>> {
        self.cached("hot", 0, limit, || async {
            let found = db::read_with_retry(|| self.repo.hot(limit as u32)).await?;
            Ok(found.into_iter().map(Recommendation::unscored).collect())
        })
        .await
    }

    pub async fn newest(&self, limit: usize) -> AppResult<Vec<Recommendation>> {
        self.cached("new", 0, limit, || async {
            let found = db::read_with_retry(|| self.repo.newest(limit as u32)).await?;
            Ok(found.into_iter().map(Recommendation::unscored).collect())
        })
        .await
    }

    /// Never cached.
    pub async fn random(&self, limit: usize) -> AppResult<Vec<Recommendation>> {
        let found = db::read_with_retry(|| self.repo.random(limit as u32)).await?;
        Ok(found.into_iter().map(Recommendation::unscored).collect())
    }

    pub async fn similar(&self, novel_id: i64, limit: usize) -> AppResult<Vec<Recommendation>> {
        self.cached("similar", novel_id, limit, || async {
            let seed = db::read_with_retry(|| self.repo.seed(novel_id))
                .await?
                .ok_or_else(|| AppError::NotFound("Novel".into()))?;

            // Authors alone do not make a novel a candidate here.
            let like = Features {
                authors: Default::default(),
                ..seed.features.clone()
            };
            let exclude: HashSet<i64> = [novel_id].into_iter().collect();
            let candidates = db::read_with_retry(|| {
                self.repo
                    .candidates(&like, &exclude, self.config.candidate_limit)
            })
            .await?;

            let scored = candidates
                .iter()
                .map(|c| Scored {
                    novel_id: c.novel.id,
                    score: similarity(&seed.features, &c.features),
                    click_count: c.novel.click_count,
                })
                .collect();
            self.materialize(similarity::top(scored, limit)).await
        })
        .await
    }

    /// Rank for a reader's profile, or fall back to hot when there is no
    /// reader or the profile is empty.
    pub async fn personalized(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<Recommendation>> {
        let Some(user_id) = user_id else {
            return self.hot(limit).await;
        };
        let profile = db::read_with_retry(|| self.repo.profile(user_id)).await?;
        if profile.features.is_empty() {
            tracing::debug!(user_id, "empty reader profile, serving hot");
            return self.hot(limit).await;
        }

        self.cached("personalized", user_id, limit, || async {
            let candidates = db::read_with_retry(|| {
                self.repo.candidates(
                    &profile.features,
                    &profile.read,
                    self.config.candidate_limit,
                )
            })
            .await?;

            let now = Utc::now();
            let scored = candidates
                .iter()
                .map(|c| {
                    let age_days = db::parse_timestamp(&c.novel.created_at)
                        .map(|created| (now - created).num_seconds() as f64 / 86_400.0)
                        .unwrap_or(0.0);
                    Scored {
                        novel_id: c.novel.id,
                        score: similarity(&profile.features, &c.features) * freshness(age_days),
                        click_count: c.novel.click_count,
                    }
                })
                .collect();
            self.materialize(similarity::top(scored, limit)).await
        })
        .await
    }

    async fn materialize(&self, ranked: Vec<Scored>) -> AppResult<Vec<Recommendation>> {
        let ids: Vec<i64> = ranked.iter().map(|s| s.novel_id).collect();
        let scores: HashMap<i64, f64> = ranked.iter().map(|s| (s.novel_id, s.score)).collect();
        let details = db::read_with_retry(|| self.repo.details(&ids)).await?;
        Ok(details
            .into_iter()
            .map(|detail| Recommendation {
                score: scores.get(&detail.novel.id).copied(),
                detail,
            })
            .collect())
    }

    async fn cached<F, Fut>(
        &self,
        op: &str,
        key: i64,
        limit: usize,
        load: F,
    ) -> AppResult<Vec<Recommendation>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AppResult<Vec<Recommendation>>>,
    {
        self.cache
            .get_or_load(
                &cache_key(op, key, limit),
                self.ttl,
                &[RECOMMEND_TAG.to_string()],
                load,
            )
            .await
    }
}
