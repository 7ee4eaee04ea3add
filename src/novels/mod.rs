pub mod domain;
pub mod repository;

pub use domain::{
    ChapterBody, ChapterHeader, NewNovel, Novel, NovelDetail, NovelFilter, NovelStatus,
    ParsingStatus, RankingKind, Suggestion, SuggestionSource,
};
pub use repository::{DynNovelRepository, NovelRepository, SqliteNovelRepository};
