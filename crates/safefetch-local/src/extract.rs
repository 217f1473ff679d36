//! Default transform: HTML to readable text via html2text, other text types passed through.
//!
//! This is deliberately plain. Readability heuristics (noise removal, heading promotion) belong
//! to richer `Transform` implementations plugged in by the embedding application.

use safefetch_core::{Result, Transform, TransformInput, TransformOutput};
use std::io::Cursor;

pub const DEFAULT_WIDTH: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct HtmlTextTransform {
    width: usize,
}

impl Default for HtmlTextTransform {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
        }
    }
}

impl HtmlTextTransform {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(20),
        }
    }
}

impl Transform for HtmlTextTransform {
    fn name(&self) -> &'static str {
        "html2text"
    }

    fn transform(&self, input: &TransformInput) -> Result<TransformOutput> {
        let ct = input
            .content_type
            .as_deref()
            .map(|s| s.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        let html = ct == "text/html"
            || ct == "application/xhtml+xml"
            || (ct.is_empty() && looks_like_html(&input.text));
        if !html {
            return Ok(TransformOutput {
                title: None,
                markdown: input.text.clone(),
            });
        }

        let title = html_title(&input.text);
        let stripped = ["script", "style", "noscript"]
            .iter()
            .fold(input.text.clone(), |acc, tag| strip_tag_blocks(&acc, tag));
        let markdown = html_to_text(&stripped, self.width);
        Ok(TransformOutput {
            title,
            markdown: markdown.trim_end().to_string(),
        })
    }
}

pub fn html_to_text(html: &str, width: usize) -> String {
    // html2text expects bytes; Cursor avoids allocating a second large buffer.
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

pub fn html_title(html: &str) -> Option<String> {
    let doc = html_scraper::Html::parse_document(html);
    let sel = html_scraper::Selector::parse("title").ok()?;
    let t = doc.select(&sel).next()?.text().collect::<Vec<_>>().join(" ");
    let t = t.split_whitespace().collect::<Vec<_>>().join(" ");
    (!t.is_empty()).then_some(t)
}

fn looks_like_html(text: &str) -> bool {
    let head: String = text.trim_start().chars().take(256).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<body")
}

/// Remove `<tag ...> ... </tag>` blocks; stops at the first unclosed one.
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let open_pat = format!("<{tag}");
    let close_pat = format!("</{tag}>");
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut i = 0usize;
    while let Some(rel) = lower[i..].find(&open_pat) {
        let start = i + rel;
        let after = start + open_pat.len();
        match lower[after..].find(&close_pat) {
            Some(rel_end) => {
                out.push_str(&html[i..start]);
                i = after + rel_end + close_pat.len();
            }
            None => break,
        }
    }
    out.push_str(&html[i..]);
    out
}
