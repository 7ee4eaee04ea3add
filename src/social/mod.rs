//! Reader interactions: ratings, threaded comments, likes and reading
//! progress. These are also the inputs of the personalized recommendation
//! profile.

pub mod comments;
pub mod likes;
pub mod progress;
pub mod ratings;

use crate::content::ensure_readable;
use crate::envelope::{Page, PageQuery};
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentUser;
use crate::novels::repository::find_novel;
use crate::state::DbPool;

pub use comments::{Comment, CommentInput};
pub use likes::{LikeState, LikeTarget};
pub use progress::{HistoryEntry, ProgressInput, ReadingProgress};
pub use ratings::{Rating, RatingInput, RatingSummary};

#[derive(Clone)]
pub struct SocialService {
    pool: DbPool,
}

impl SocialService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn readable(
        &self,
        conn: &rusqlite::Connection,
        novel_id: i64,
        viewer: Option<&CurrentUser>,
    ) -> AppResult<()> {
        let novel = find_novel(conn, novel_id)?.ok_or_else(|| AppError::NotFound("Novel".into()))?;
        ensure_readable(&novel, viewer)
    }

    pub fn rate(&self, user: &CurrentUser, novel_id: i64, input: &RatingInput) -> AppResult<Rating> {
        let (score, comment) = input.normalized()?;
        let conn = self.pool.get()?;
        self.readable(&conn, novel_id, Some(user))?;
        let rating = ratings::insert(&conn, novel_id, user.id, score, comment.as_deref())?;
        tracing::info!(novel_id, user_id = user.id, score, "novel rated");
        Ok(rating)
    }

    pub fn ratings(
        &self,
        novel_id: i64,
        viewer: Option<&CurrentUser>,
        page: PageQuery,
    ) -> AppResult<RatingSummary> {
        let page = page.normalized();
        let conn = self.pool.get()?;
        self.readable(&conn, novel_id, viewer)?;
        ratings::summary(&conn, novel_id, page.page, page.limit)
    }

    pub fn comment(
        &self,
        user: &CurrentUser,
        novel_id: i64,
        input: &CommentInput,
    ) -> AppResult<Comment> {
        let content = input.content()?;
        let conn = self.pool.get()?;
        self.readable(&conn, novel_id, Some(user))?;
        comments::insert(&conn, novel_id, user.id, content, input.parent_id)
    }

    pub fn comments(
        &self,
        novel_id: i64,
        viewer: Option<&CurrentUser>,
        page: PageQuery,
    ) -> AppResult<Page<Comment>> {
        let page = page.normalized();
        let conn = self.pool.get()?;
        self.readable(&conn, novel_id, viewer)?;
        let (items, total) = comments::thread_page(&conn, novel_id, page.page, page.limit)?;
        Ok(Page {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    pub fn save_progress(
        &self,
        user: &CurrentUser,
        novel_id: i64,
        input: &ProgressInput,
    ) -> AppResult<ReadingProgress> {
        input.validate()?;
        let conn = self.pool.get()?;
        self.readable(&conn, novel_id, Some(user))?;
        progress::upsert(&conn, user.id, novel_id, input)
    }

    pub fn progress(&self, user: &CurrentUser, novel_id: i64) -> AppResult<ReadingProgress> {
        let conn = self.pool.get()?;
        progress::find(&conn, user.id, novel_id)?
            .ok_or_else(|| AppError::NotFound("Reading progress".into()))
    }

    pub fn history(&self, user: &CurrentUser, page: PageQuery) -> AppResult<Page<HistoryEntry>> {
        let page = page.normalized();
        let conn = self.pool.get()?;
        let (items, total) = progress::history(&conn, user.id, page.page, page.limit)?;
        Ok(Page {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    /// Like or unlike a visible comment or rating on a novel the user can read.
    pub fn set_like(
        &self,
        user: &CurrentUser,
        target: LikeTarget,
        id: i64,
        liked: bool,
    ) -> AppResult<LikeState> {
        let conn = self.pool.get()?;
        let novel_id = likes::target_novel(&conn, target, id)?;
        self.readable(&conn, novel_id, Some(user))?;
        let state = likes::set(&conn, target, user.id, id, liked)?;
        tracing::debug!(id, ?target, user_id = user.id, liked, "like updated");
        Ok(state)
    }
}
