//! Lightweight structural parsing of HTML announcement pages.
//!
//! Two jobs, both driven by [`scraper`]:
//!
//! 1. [`extract_text`] turns a page into line-oriented plain text. Block-level
//!    elements end a line; inline markup (`<b>`, `<span>`, links) stays on the
//!    current line so `시청역 <b>→</b> 서울역` reads as one chain.
//! 2. [`discover_attachments`] finds PDF/image attachments linked from the
//!    page so the fetcher can follow them one level deep.

use crate::model::{DocumentKind, Source};
use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;

/// Containers that hold the announcement body on common municipal CMSs.
static CONTENT_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        ".view-con",
        ".view_con",
        ".board-view",
        ".bbs-view",
        ".view-content",
        ".content-view",
        "#contents",
        "article",
        "main",
        "body",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

static LINK_SELECTOR: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("a[href]").ok());

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "tbody", "thead", "h1", "h2", "h3", "h4",
    "h5", "h6", "section", "article", "header", "footer", "dd", "dt", "dl", "pre", "blockquote",
    "hr", "caption",
];

/// Plain text of the page's main content, one logical line per block.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = CONTENT_SELECTORS
        .iter()
        .find_map(|sel| document.select(sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut lines = Vec::new();
    let mut current = String::new();
    walk(root, &mut lines, &mut current);
    flush(&mut lines, &mut current);
    lines.join("\n")
}

fn walk(element: ElementRef<'_>, lines: &mut Vec<String>, current: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let t: &str = text;
                let collapsed = t.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed.is_empty() {
                    continue;
                }
                if !current.is_empty() && !current.ends_with(' ') && t.starts_with(char::is_whitespace) {
                    current.push(' ');
                }
                current.push_str(&collapsed);
                if t.ends_with(char::is_whitespace) {
                    current.push(' ');
                }
            }
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                let is_block = BLOCK_ELEMENTS.contains(&name);
                if is_block {
                    flush(lines, current);
                }
                if name == "td" || name == "th" {
                    if !current.is_empty() && !current.ends_with(' ') {
                        current.push(' ');
                    }
                }
                walk(child_ref, lines, current);
                if is_block {
                    flush(lines, current);
                }
            }
            _ => {}
        }
    }
}

fn flush(lines: &mut Vec<String>, current: &mut String) {
    let line = current.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
    current.clear();
}

/// PDF/image attachments linked from an HTML page, as derived sources.
///
/// A link qualifies when its `href` or its visible text (municipal boards
/// often use opaque `fileDown.do?id=…` URLs with the filename as link text)
/// names a PDF or image file.
pub fn discover_attachments(page: &Source, html: &str) -> Vec<Source> {
    let Some(selector) = LINK_SELECTOR.as_ref() else {
        return Vec::new();
    };
    let Ok(base) = Url::parse(&page.url) else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut found: Vec<Source> = Vec::new();

    for link in document.select(selector) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }

        let text = link.text().collect::<String>();
        let kind = match DocumentKind::from_url(href) {
            DocumentKind::Html => DocumentKind::from_url(text.trim()),
            k => k,
        };
        if kind == DocumentKind::Html {
            continue;
        }

        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let url = resolved.to_string();
        if url == page.url || found.iter().any(|s| s.url == url) {
            continue;
        }

        debug!("{}: attachment {}", page.url, url);
        found.push(Source {
            authority: page.authority.clone(),
            url,
            kind,
            discovered_from: Some(page.url.clone()),
        });
    }

    found
}
