use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::activity::ActivityRecorder;
use crate::auth::TokenSigner;
use crate::blob::BlobArea;
use crate::cache::Cache;
use crate::clicks::{self, ClickRecorder, ClickStream};
use crate::config::Config;
use crate::content::ContentService;
use crate::error::AppResult;
use crate::ingest::{IngestService, ParseJobs, ParseQueue};
use crate::novels::{DynNovelRepository, SqliteNovelRepository};
use crate::recommend::{Recommender, SqliteRecommendRepository};
use crate::review::{AdminCatalog, ReviewService, SqliteReviewRepository};
use crate::social::SocialService;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub tokens: Arc<TokenSigner>,
    pub blobs: BlobArea,
    pub cache: Cache,
    pub clicks: ClickRecorder,
    pub parse_queue: ParseQueue,
    pub activity: ActivityRecorder,
    pub novels: DynNovelRepository,
    pub ingest: IngestService,
    pub content: ContentService,
    pub review: ReviewService,
    pub catalog: AdminCatalog,
    pub recommender: Recommender,
    pub social: SocialService,
}

/// Receiving ends of the work channels, handed to [`crate::workers::spawn`].
pub struct Channels {
    pub parse_jobs: ParseJobs,
    pub clicks: ClickStream,
}

impl AppState {
    pub fn build(pool: DbPool, config: Config, tokens: TokenSigner) -> AppResult<(Self, Channels)> {
        let blobs = BlobArea::new(config.blob_root());
        let cache = Cache::memory(config.cache.max_entries);
        let activity = ActivityRecorder::new(pool.clone());
        let novels: DynNovelRepository = Arc::new(SqliteNovelRepository::new(pool.clone()));

        let (parse_queue, parse_jobs) = ParseQueue::new(config.parser.queue_capacity);
        let offset = clicks::clock_offset(config.clicks.utc_offset_hours)?;
        let (click_recorder, click_stream) =
            ClickRecorder::new(config.clicks.channel_capacity, offset);

        let ingest = IngestService::new(
            novels.clone(),
            blobs.clone(),
            parse_queue.clone(),
            cache.clone(),
            activity.clone(),
            config.upload.clone(),
        );
        let content = ContentService::new(
            novels.clone(),
            blobs.clone(),
            cache.clone(),
            click_recorder.clone(),
            config.cache.clone(),
        );
        let review = ReviewService::new(
            Arc::new(SqliteReviewRepository::new(pool.clone())),
            novels.clone(),
            blobs.clone(),
            cache.clone(),
            parse_queue.clone(),
            chrono::Duration::days(config.review.expire_days),
        );
        let recommender = Recommender::new(
            Arc::new(SqliteRecommendRepository::new(pool.clone())),
            cache.clone(),
            Duration::from_secs(config.cache.recommend_ttl_secs),
            config.recommend.clone(),
        );

        let state = AppState {
            catalog: AdminCatalog::new(pool.clone()),
            social: SocialService::new(pool.clone()),
            db: pool,
            config: Arc::new(config),
            tokens: Arc::new(tokens),
            blobs,
            cache,
            clicks: click_recorder,
            parse_queue,
            activity,
            novels,
            ingest,
            content,
            review,
            recommender,
        };
        let channels = Channels {
            parse_jobs,
            clicks: click_stream,
        };
        Ok((state, channels))
    }
}
