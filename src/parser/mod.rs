//! Splits a raw novel file into ordered chapters.
//!
//! Parsing is pure: the same bytes and patterns always yield the same
//! chapters, and nothing here touches the database or the blob area.

pub mod epub;
pub mod txt;

use regex::RegexSet;
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("file contains no readable text")]
    Empty,

    #[error("invalid heading pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("unreadable e-book archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("e-book is missing {0}")]
    MissingPart(String),

    #[error("malformed e-book markup: {0}")]
    Markup(String),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ParseError> for AppError {
    fn from(err: ParseError) -> Self {
        AppError::Parse(err.to_string())
    }
}

/// Accepted upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Txt,
    Epub,
}

impl FileKind {
    /// Classify by extension, case-insensitively.
    pub fn from_filename(name: &str) -> Option<Self> {
        let (_, ext) = name.trim().rsplit_once('.')?;
        Self::from_extension(ext)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" => Some(FileKind::Txt),
            "epub" => Some(FileKind::Epub),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Txt => "txt",
            FileKind::Epub => "epub",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            FileKind::Txt => "text/plain; charset=utf-8",
            FileKind::Epub => "application/epub+zip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChapter {
    /// 1-based, dense.
    pub position: u32,
    pub title: String,
    pub body: String,
    /// Byte range `[start, end)` of the original file backing this chapter.
    pub start: u64,
    pub end: u64,
    pub word_count: u64,
}

/// Non-whitespace characters; how novel length is measured.
pub fn word_count(text: &str) -> u64 {
    text.chars().filter(|c| !c.is_whitespace()).count() as u64
}

pub struct ChapterParser {
    headings: RegexSet,
}

impl ChapterParser {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ParseError> {
        let headings = RegexSet::new(patterns.iter().map(|p| p.as_ref()))?;
        Ok(Self { headings })
    }

    pub fn parse(&self, bytes: &[u8], kind: FileKind) -> Result<Vec<ParsedChapter>, ParseError> {
        let chapters = match kind {
            FileKind::Txt => txt::split(bytes, &self.headings),
            FileKind::Epub => epub::extract(bytes)?,
        };
        if chapters.is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(chapters)
    }
}

/// Assign dense positions and word counts to `(title, body, start, end)` parts.
pub(crate) fn number(parts: Vec<(String, String, u64, u64)>) -> Vec<ParsedChapter> {
    parts
        .into_iter()
        .enumerate()
        .map(|(i, (title, body, start, end))| ParsedChapter {
            position: i as u32 + 1,
            word_count: word_count(&body),
            title,
            body,
            start,
            end,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_heading_patterns;

    #[test]
    fn file_kind_is_case_insensitive() {
        assert_eq!(FileKind::from_filename("书.TXT"), Some(FileKind::Txt));
        assert_eq!(FileKind::from_filename("a.b.Epub"), Some(FileKind::Epub));
        assert_eq!(FileKind::from_filename("novel.pdf"), None);
        assert_eq!(FileKind::from_filename("txt"), None);
    }

    #[test]
    fn word_count_ignores_whitespace() {
        assert_eq!(word_count("你好 世界\n"), 4);
        assert_eq!(word_count("　　第一段\r\n"), 3);
        assert_eq!(word_count("two words"), 8);
        assert_eq!(word_count(""), 0);
    }

    #[test]
    fn empty_file_is_a_parse_error() {
        let parser = ChapterParser::new(&default_heading_patterns()).unwrap();
        assert!(matches!(
            parser.parse(b"  \n\n ", FileKind::Txt),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(matches!(
            ChapterParser::new(&["(open"]),
            Err(ParseError::Pattern(_))
        ));
    }

    #[test]
    fn garbage_epub_is_an_archive_error() {
        let parser = ChapterParser::new(&default_heading_patterns()).unwrap();
        assert!(matches!(
            parser.parse(b"not a zip", FileKind::Epub),
            Err(ParseError::Archive(_))
        ));
    }
}
