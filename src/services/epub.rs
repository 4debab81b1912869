use anyhow::{anyhow, Context, Result};
use epub::doc::EpubDoc;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::chunker::Section;
use crate::utils::text::sanitize_file_name;

const UNKNOWN: &str = "Unknown";

/// A book reduced to its metadata and ordered plain-text sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub title: String,
    pub author: String,
    pub sections: Vec<Section>,
}

impl Book {
    /// KOReader sidecar folder name, `<Author> - <Title>.epub.sdr`.
    pub fn sdr_name(&self) -> String {
        format!(
            "{} - {}.epub.sdr",
            sanitize_file_name(&self.author),
            sanitize_file_name(&self.title)
        )
    }
}

pub trait BookSource: Send + Sync {
    fn load(&self) -> Result<Book>;
}

pub struct EpubSource {
    path: PathBuf,
}

impl EpubSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BookSource for EpubSource {
    fn load(&self) -> Result<Book> {
        let mut doc = EpubDoc::new(&self.path)
            .map_err(|e| anyhow!("Failed to open {}: {}", self.path.display(), e))?;

        let title = doc
            .mdata("title")
            .map(|m| m.value.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let author = doc
            .mdata("creator")
            .map(|m| m.value.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let mut toc_titles = HashMap::new();
        let mut stack: Vec<&epub::doc::NavPoint> = doc.toc.iter().collect();
        while let Some(point) = stack.pop() {
            let target = strip_fragment(&point.content);
            toc_titles.entry(target).or_insert_with(|| point.label.trim().to_string());
            stack.extend(point.children.iter());
        }

        let mut sections = Vec::new();
        for index in 0..doc.get_num_chapters() {
            doc.set_current_chapter(index);
            let Some((html, mime)) = doc.get_current_str() else {
                warn!("Skipping unreadable spine item {} in {}", index, self.path.display());
                continue;
            };
            if mime != "application/xhtml+xml" && mime != "text/html" {
                debug!("Skipping spine item {} with MIME type {}", index, mime);
                continue;
            }

            let text = html2text::from_read(html.as_bytes(), 500)
                .with_context(|| format!("Failed to convert spine item {}", index))?;
            if text.trim().is_empty() {
                continue;
            }

            let toc_title = doc
                .get_current_path()
                .and_then(|p| toc_titles.get(&strip_fragment(&p)).cloned());
            let section_title = chapter_title(&html, toc_title.as_deref(), &title)
                .unwrap_or_else(|| format!("第{}节", sections.len() + 1));
            sections.push(Section::new(section_title, text));
        }

        Ok(Book {
            title,
            author,
            sections,
        })
    }
}

fn strip_fragment(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(raw.split('#').next().unwrap_or_default())
}

/// Table-of-contents label, else the first `h1`..`h3`, else `<title>`,
/// skipping anything equal to the book title or implausibly long.
fn chapter_title(html: &str, toc_title: Option<&str>, book_title: &str) -> Option<String> {
    let usable = |t: &str| !t.is_empty() && t.chars().count() < 100 && t != book_title;

    if let Some(toc) = toc_title.filter(|t| usable(t)) {
        return Some(toc.to_string());
    }
    ["h1", "h2", "h3", "title"]
        .iter()
        .filter_map(|tag| element_text(html, tag))
        .find(|t| usable(t))
}

/// Text of the first `<tag ...>...</tag>` element, inner markup removed.
fn element_text(html: &str, tag: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let mut from = 0;
    let start = loop {
        let at = from + lower[from..].find(&open)?;
        let next = lower.as_bytes().get(at + open.len()).copied();
        if matches!(next, Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            break at;
        }
        from = at + open.len();
    };
    let content_start = start + lower[start..].find('>')? + 1;
    let content_end = content_start + lower[content_start..].find(&close)?;

    let mut text = String::new();
    let mut in_tag = false;
    for c in html[content_start..content_end].chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdr_name_is_filesystem_safe() {
        let book = Book {
            title: "What? A/B".into(),
            author: "J: Doe".into(),
            sections: vec![],
        };
        assert_eq!(book.sdr_name(), "J_ Doe - What_ A_B.epub.sdr");
    }

    #[test]
    fn test_heading_preferred_over_title_tag() {
        let html = r#"<html><head><title>珍珠</title></head>
            <body><h2 class="c"><span>第一章</span>&nbsp;海湾</h2><p>正文</p></body></html>"#;
        assert_eq!(chapter_title(html, None, "珍珠").as_deref(), Some("第一章 海湾"));
    }

    #[test]
    fn test_toc_title_wins_unless_it_is_the_book_title() {
        let html = "<h1>Chapter One</h1>";
        assert_eq!(chapter_title(html, Some("序章"), "珍珠").as_deref(), Some("序章"));
        assert_eq!(chapter_title(html, Some("珍珠"), "珍珠").as_deref(), Some("Chapter One"));
    }

    #[test]
    fn test_book_title_heading_is_skipped() {
        let html = "<head><title>Chapter 3</title></head><h1>珍珠</h1>";
        assert_eq!(chapter_title(html, None, "珍珠").as_deref(), Some("Chapter 3"));
        assert_eq!(chapter_title("<p>no headings</p>", None, "珍珠"), None);
    }

    #[test]
    fn test_element_text_ignores_prefix_matches() {
        assert_eq!(element_text("<header>x</header><h1>Real</h1>", "h1").as_deref(), Some("Real"));
        assert_eq!(element_text("<hr/><h1>Real</h1>", "h1").as_deref(), Some("Real"));
        assert_eq!(element_text("<head></head><title>T</title>", "title").as_deref(), Some("T"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(EpubSource::new("/nonexistent/book.epub").load().is_err());
    }
}
