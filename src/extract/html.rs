//! HTML pages, rendered to wrapped plain text.

use async_trait::async_trait;
use scraper::{Html, Selector};

use super::text::decode_text;
use super::{ExtractedDocument, FileInput, FormatHandler};
use crate::error::ExtractError;

pub const MIME_HTML: &str = "text/html";

const WRAP_WIDTH: usize = 80;

pub struct HtmlHandler;

/// `<title>`, or the first `<h1>` when the title is missing.
fn page_title(document: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        let text: String = document.select(&selector).next()?.text().collect();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    })
}

fn count(document: &Html, tag: &str) -> usize {
    Selector::parse(tag)
        .map(|s| document.select(&s).count())
        .unwrap_or(0)
}

#[async_trait]
impl FormatHandler for HtmlHandler {
    fn name(&self) -> &str {
        "html"
    }

    fn mime_types(&self) -> &[&'static str] {
        &[MIME_HTML, "application/xhtml+xml"]
    }

    fn extensions(&self) -> &[&'static str] {
        &["html", "htm", "xhtml"]
    }

    async fn extract(&self, input: FileInput<'_>) -> Result<ExtractedDocument, ExtractError> {
        let (html, warning) = decode_text(input.bytes);
        let document = Html::parse_document(&html);
        let title = page_title(&document);
        let tables = count(&document, "table");
        let images = count(&document, "img");

        let text = html2text::from_read(html.as_bytes(), WRAP_WIDTH).replace('\0', "");
        let mut doc = ExtractedDocument::new(text);
        doc.metadata.title = title;
        doc.warnings.extend(warning);
        if tables > 0 {
            doc.warnings
                .push(format!("{} table(s) flattened to plain text", tables));
        }
        if images > 0 {
            doc.warnings.push(format!("{} image(s) dropped", images));
        }
        Ok(doc)
    }
}
