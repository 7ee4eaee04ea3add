use regex::RegexSet;

use super::ParsedChapter;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Longer lines are body text even when they start like a heading.
const MAX_HEADING_CHARS: usize = 60;

pub const PROLOGUE_TITLE: &str = "序章";
pub const WHOLE_TEXT_TITLE: &str = "正文";

struct Heading {
    /// Offset of the heading line.
    line_start: usize,
    /// Offset just past the heading line.
    body_start: usize,
    title: String,
}

/// Split plain text on heading lines. Offsets refer to the raw bytes, so
/// invalid UTF-8 is decoded lossily per chapter without shifting them.
pub fn split(bytes: &[u8], headings: &RegexSet) -> Vec<ParsedChapter> {
    let base = if bytes.starts_with(UTF8_BOM) {
        UTF8_BOM.len()
    } else {
        0
    };

    let marks = find_headings(bytes, base, headings);
    let mut parts = Vec::new();

    let Some(first) = marks.first() else {
        let body = decode_body(&bytes[base..]);
        if !body.is_empty() {
            parts.push((
                WHOLE_TEXT_TITLE.to_string(),
                body,
                base as u64,
                bytes.len() as u64,
            ));
        }
        return super::number(parts);
    };

    let preamble = decode_body(&bytes[base..first.line_start]);
    if !preamble.is_empty() {
        parts.push((
            PROLOGUE_TITLE.to_string(),
            preamble,
            base as u64,
            first.line_start as u64,
        ));
    }

    for (i, mark) in marks.iter().enumerate() {
        let end = marks
            .get(i + 1)
            .map(|next| next.line_start)
            .unwrap_or(bytes.len());
        let body = decode_body(&bytes[mark.body_start..end]);
        // A heading with nothing under it is a table-of-contents line.
        if body.is_empty() {
            continue;
        }
        parts.push((mark.title.clone(), body, mark.line_start as u64, end as u64));
    }

    super::number(parts)
}

fn find_headings(bytes: &[u8], base: usize, headings: &RegexSet) -> Vec<Heading> {
    let mut marks = Vec::new();
    let mut pos = base;

    while pos < bytes.len() {
        let line_end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i)
            .unwrap_or(bytes.len());
        let next = (line_end + 1).min(bytes.len());

        let line = String::from_utf8_lossy(&bytes[pos..line_end]);
        let text = line.trim();
        if !text.is_empty()
            && text.chars().count() <= MAX_HEADING_CHARS
            && headings.is_match(text)
        {
            marks.push(Heading {
                line_start: pos,
                body_start: next,
                title: text.to_string(),
            });
        }

        pos = next;
    }

    marks
}

fn decode_body(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace("\r\n", "\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_heading_patterns;

    fn headings() -> RegexSet {
        RegexSet::new(default_heading_patterns()).unwrap()
    }

    #[test]
    fn splits_on_chinese_headings() {
        let text = "第一章 开端\n他来了。\n第二章 离别\n她走了。\n";
        let chapters = split(text.as_bytes(), &headings());

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].position, 1);
        assert_eq!(chapters[0].title, "第一章 开端");
        assert_eq!(chapters[0].body, "他来了。");
        assert_eq!(chapters[1].position, 2);
        assert_eq!(chapters[1].title, "第二章 离别");
        assert_eq!(chapters[1].body, "她走了。");
        assert_eq!(chapters[1].word_count, 4);
    }

    #[test]
    fn offsets_cover_the_raw_file() {
        let text = "第1章\nabc\r\n第2章：下\r\ndef\n";
        let bytes = text.as_bytes();
        let chapters = split(bytes, &headings());

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].start, 0);
        assert_eq!(chapters[0].end, chapters[1].start);
        assert_eq!(chapters[1].end, bytes.len() as u64);
        let second = &bytes[chapters[1].start as usize..chapters[1].end as usize];
        assert!(String::from_utf8_lossy(second).starts_with("第2章：下"));
        assert_eq!(chapters[1].body, "def");
    }

    #[test]
    fn english_and_numeric_headings() {
        let text = "Chapter 1 The Start\nfoo\nCHAPTER 2\nbar\n3. Third\nbaz\n";
        let chapters = split(text.as_bytes(), &headings());
        let titles: Vec<_> = chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["Chapter 1 The Start", "CHAPTER 2", "3. Third"]);
    }

    #[test]
    fn preamble_becomes_prologue() {
        let text = "作者的话：感谢阅读\n第一章\n正文内容\n";
        let chapters = split(text.as_bytes(), &headings());
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, PROLOGUE_TITLE);
        assert_eq!(chapters[0].body, "作者的话：感谢阅读");
        assert_eq!(chapters[1].position, 2);
    }

    #[test]
    fn no_headings_yields_single_chapter() {
        let text = "just a short story\nwith two lines\n";
        let chapters = split(text.as_bytes(), &headings());
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, WHOLE_TEXT_TITLE);
        assert_eq!(chapters[0].start, 0);
        assert_eq!(chapters[0].end, text.len() as u64);
    }

    #[test]
    fn table_of_contents_lines_are_dropped_and_positions_stay_dense() {
        let text = "第一章\n第二章\n第三章\n第一章\n甲\n第二章\n乙\n";
        let chapters = split(text.as_bytes(), &headings());
        let positions: Vec<u32> = chapters.iter().map(|c| c.position).collect();
        assert_eq!(positions, [1, 2]);
        assert_eq!(chapters[0].body, "甲");
        assert_eq!(chapters[1].body, "乙");
    }

    #[test]
    fn long_lines_are_not_headings() {
        let long = format!("第一章{}\n", "很".repeat(80));
        let chapters = split(long.as_bytes(), &headings());
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, WHOLE_TEXT_TITLE);
    }

    #[test]
    fn bom_is_skipped_and_invalid_utf8_survives() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("第一章\n".as_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe, b'o', b'k', b'\n']);
        let chapters = split(&bytes, &headings());
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].start, 3);
        assert_eq!(chapters[0].end, bytes.len() as u64);
        assert!(chapters[0].body.ends_with("ok"));
    }

    #[test]
    fn parsing_is_deterministic() {
        let text = "楔子\n起\n第一回 风起\n承\n尾声\n合\n";
        let a = split(text.as_bytes(), &headings());
        let b = split(text.as_bytes(), &headings());
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].title, "楔子");
        assert_eq!(a[2].title, "尾声");
    }
}
