use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use zip::ZipArchive;

use super::ParseError;
use super::ParsedChapter;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Fixed part of a zip local file header.
const LOCAL_HEADER_LEN: u64 = 30;
const LOCAL_HEADER_SIG: &[u8] = b"PK\x03\x04";

/// Walk the OPF spine and turn each content document into a chapter.
pub fn extract(bytes: &[u8]) -> Result<Vec<ParsedChapter>, ParseError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let container = read_entry(&mut archive, bytes, CONTAINER_PATH)?.0;
    let opf_path = rootfile_path(&container)?;
    let opf = read_entry(&mut archive, bytes, &opf_path)?.0;
    let package = parse_package(&opf)?;
    let base_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");

    let mut parts = Vec::new();
    for idref in &package.spine {
        let Some(href) = package.manifest.get(idref) else {
            tracing::debug!(idref = %idref, "spine item missing from manifest");
            continue;
        };
        let path = resolve_href(base_dir, href);
        let (markup, (start, end)) = match read_entry(&mut archive, bytes, &path) {
            Ok(found) => found,
            Err(ParseError::MissingPart(_)) => {
                tracing::debug!(path = %path, "spine item missing from archive");
                continue;
            }
            Err(e) => return Err(e),
        };

        let doc = document_text(&markup);
        if doc.body.trim().is_empty() {
            continue;
        }
        let position = parts.len() + 1;
        let title = doc
            .title
            .or(doc.heading)
            .unwrap_or_else(|| format!("Chapter {}", position));
        parts.push((title, doc.body, start, end));
    }

    Ok(super::number(parts))
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    raw: &[u8],
    name: &str,
) -> Result<(String, (u64, u64)), ParseError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ParseError::MissingPart(name.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let range = entry_span(raw, entry.header_start(), entry.compressed_size());

    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    Ok((String::from_utf8_lossy(&buf).into_owned(), range))
}

/// Byte range from the entry's local header to the end of its compressed data.
fn entry_span(raw: &[u8], header_start: u64, compressed: u64) -> (u64, u64) {
    let h = header_start as usize;
    let total = raw.len() as u64;
    match raw.get(h..h + LOCAL_HEADER_LEN as usize) {
        Some(header) if header.starts_with(LOCAL_HEADER_SIG) => {
            let name_len = u16::from_le_bytes([header[26], header[27]]) as u64;
            let extra_len = u16::from_le_bytes([header[28], header[29]]) as u64;
            let data_start = header_start + LOCAL_HEADER_LEN + name_len + extra_len;
            (header_start, (data_start + compressed).min(total))
        }
        _ => (header_start.min(total), total),
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn rootfile_path(container: &str) -> Result<String, ParseError> {
    let mut reader = XmlReader::from_str(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                if let Some(path) = attr(e, b"full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Markup(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Err(ParseError::MissingPart("package document".into()))
}

struct Package {
    manifest: HashMap<String, String>,
    spine: Vec<String>,
}

fn parse_package(opf: &str) -> Result<Package, ParseError> {
    let mut reader = XmlReader::from_str(opf);
    let mut buf = Vec::new();
    let mut manifest = HashMap::new();
    let mut spine = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attr(e, b"id"), attr(e, b"href")) {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attr(e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Markup(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(Package { manifest, spine })
}

/// Join an OPF-relative href onto the OPF directory, dropping fragments and
/// resolving `.`/`..` segments.
fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or_default().replace("%20", " ");
    let mut segments: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[derive(Debug, Default)]
struct DocumentText {
    title: Option<String>,
    heading: Option<String>,
    body: String,
}

fn is_block(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"div" | b"br" | b"li" | b"tr" | b"section" | b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6"
    )
}

fn is_title_heading(name: &[u8]) -> bool {
    matches!(name, b"h1" | b"h2" | b"h3")
}

/// Visible text of an XHTML document, plus its `<title>` and first h1–h3.
/// Markup errors end the walk early and keep what was read so far.
fn document_text(markup: &str) -> DocumentText {
    let mut reader = XmlReader::from_str(markup);
    reader.config_mut().check_end_names = false;

    let mut buf = Vec::new();
    let mut doc = DocumentText::default();
    let mut in_title = false;
    let mut in_body = false;
    let mut skipping = 0usize;
    let mut heading: Option<String> = None;
    let mut title_text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                match name {
                    b"title" if !in_body => in_title = true,
                    b"body" => in_body = true,
                    b"script" | b"style" => skipping += 1,
                    n if in_body && is_title_heading(n) && doc.heading.is_none() => {
                        heading = Some(String::new());
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if in_body && is_block(e.local_name().as_ref()) {
                    doc.body.push('\n');
                }
            }
            Ok(Event::Text(e)) => {
                if skipping > 0 {
                    buf.clear();
                    continue;
                }
                let text = match e.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(_) => decode_entities_lossy(&String::from_utf8_lossy(&e)),
                };
                if in_title {
                    title_text.push_str(&text);
                } else if in_body {
                    if let Some(h) = heading.as_mut() {
                        h.push_str(&text);
                    }
                    doc.body.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if in_body && skipping == 0 {
                    doc.body.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                match name {
                    b"title" => in_title = false,
                    b"body" => in_body = false,
                    b"script" | b"style" => skipping = skipping.saturating_sub(1),
                    _ => {}
                }
                if in_body && is_title_heading(name) {
                    if let Some(h) = heading.take() {
                        let h = collapse_whitespace(&h);
                        if !h.is_empty() {
                            doc.heading = Some(h);
                        }
                    }
                }
                if in_body && is_block(name) {
                    doc.body.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stopping at malformed chapter markup");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    let title = collapse_whitespace(&title_text);
    if !title.is_empty() {
        doc.title = Some(title);
    }
    doc.body = tidy_lines(&doc.body);
    doc
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim each line and collapse runs of blank lines.
fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// XHTML in the wild uses HTML entities that XML does not define.
fn decode_entities_lossy(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&hellip;", "…")
        .replace("&mdash;", "—")
        .replace("&ldquo;", "“")
        .replace("&rdquo;", "”")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_epub(chapters: &[(&str, &str)], spine_extra: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        writer.start_file("mimetype", stored).unwrap();
        writer.write_all(b"application/epub+zip").unwrap();

        writer.start_file("META-INF/container.xml", deflated).unwrap();
        writer
            .write_all(
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
            )
            .unwrap();

        let mut manifest = String::new();
        let mut spine = String::new();
        for (i, (name, _)) in chapters.iter().enumerate() {
            manifest.push_str(&format!(
                r#"<item id="c{i}" href="text/{name}" media-type="application/xhtml+xml"/>"#
            ));
            spine.push_str(&format!(r#"<itemref idref="c{i}"/>"#));
        }
        spine.push_str(spine_extra);
        let opf = format!(
            r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
        );
        writer.start_file("OEBPS/content.opf", deflated).unwrap();
        writer.write_all(opf.as_bytes()).unwrap();

        for (name, body) in chapters {
            writer
                .start_file(format!("OEBPS/text/{name}"), deflated)
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }

        writer.finish().unwrap().into_inner()
    }

    fn xhtml(title: &str, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>{title}</title></head>
<body>{body}</body></html>"#
        )
    }

    #[test]
    fn chapters_follow_spine_order() {
        let one = xhtml("第一章 起", "<p>天下大势</p><p>分久必合</p>");
        let two = xhtml("第二章 承", "<p>合久必分</p>");
        let bytes = build_epub(&[("b.xhtml", &two), ("a.xhtml", &one)], "");

        let chapters = extract(&bytes).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "第二章 承");
        assert_eq!(chapters[0].body, "合久必分");
        assert_eq!(chapters[1].title, "第一章 起");
        assert_eq!(chapters[1].body, "天下大势\n分久必合");
        assert_eq!(chapters[1].position, 2);
        assert_eq!(chapters[1].word_count, 8);
    }

    #[test]
    fn title_falls_back_to_heading_then_position() {
        let headed = xhtml("", "<h2>楔子</h2><p>风起</p>");
        let bare = xhtml("", "<p>云涌</p>");
        let bytes = build_epub(&[("h.xhtml", &headed), ("b.xhtml", &bare)], "");

        let chapters = extract(&bytes).unwrap();
        assert_eq!(chapters[0].title, "楔子");
        assert_eq!(chapters[1].title, "Chapter 2");
    }

    #[test]
    fn empty_documents_and_dangling_spine_items_are_skipped() {
        let cover = xhtml("封面", r#"<img src="cover.jpg"/>"#);
        let text = xhtml("正文", "<p>内容&nbsp;在此 &amp; 那里</p>");
        let bytes = build_epub(
            &[("cover.xhtml", &cover), ("text.xhtml", &text)],
            r#"<itemref idref="missing"/>"#,
        );

        let chapters = extract(&bytes).unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].position, 1);
        assert_eq!(chapters[0].title, "正文");
        assert!(chapters[0].body.contains("& 那里"));
    }

    #[test]
    fn offsets_point_into_the_archive() {
        let one = xhtml("一", "<p>甲</p>");
        let two = xhtml("二", "<p>乙</p>");
        let bytes = build_epub(&[("1.xhtml", &one), ("2.xhtml", &two)], "");

        let chapters = extract(&bytes).unwrap();
        for chapter in &chapters {
            assert!(chapter.start < chapter.end);
            assert!(chapter.end <= bytes.len() as u64);
            let header = &bytes[chapter.start as usize..chapter.start as usize + 4];
            assert_eq!(header, LOCAL_HEADER_SIG);
        }
        assert!(chapters[0].end <= chapters[1].start);
    }

    #[test]
    fn missing_container_is_reported() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("mimetype", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"application/epub+zip").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        assert!(matches!(extract(&bytes), Err(ParseError::MissingPart(_))));
    }

    #[test]
    fn hrefs_resolve_against_the_package_directory() {
        assert_eq!(resolve_href("OEBPS", "text/a.xhtml#top"), "OEBPS/text/a.xhtml");
        assert_eq!(resolve_href("OEBPS/x", "../b.xhtml"), "OEBPS/b.xhtml");
        assert_eq!(resolve_href("", "c%20d.xhtml"), "c d.xhtml");
    }
}
