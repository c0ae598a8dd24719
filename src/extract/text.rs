//! Plain text, Markdown, CSV and JSON.

use async_trait::async_trait;

use super::{ExtractedDocument, FileInput, FormatHandler};
use crate::error::ExtractError;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_JSON: &str = "application/json";

pub struct TextHandler;

/// Decode bytes as UTF-8 (dropping a BOM), falling back to Latin-1.
/// Returns the text and, for the fallback, a warning.
pub fn decode_text(bytes: &[u8]) -> (String, Option<String>) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), None),
        Err(_) => (
            bytes.iter().map(|&b| b as char).collect(),
            Some("content is not valid UTF-8; decoded as Latin-1".to_string()),
        ),
    }
}

/// First Markdown `# ` heading, if any.
fn markdown_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FormatHandler for TextHandler {
    fn name(&self) -> &str {
        "text"
    }

    fn mime_types(&self) -> &[&'static str] {
        &[MIME_TEXT, MIME_MARKDOWN, "text/x-markdown", MIME_CSV, MIME_JSON]
    }

    fn extensions(&self) -> &[&'static str] {
        &["txt", "md", "markdown", "csv", "json", "log", "rst"]
    }

    async fn extract(&self, input: FileInput<'_>) -> Result<ExtractedDocument, ExtractError> {
        let (text, warning) = decode_text(input.bytes);
        let mut doc = ExtractedDocument::new(text);
        if let Some(w) = warning {
            doc.warnings.push(w);
        }
        let is_markdown = input.mime_type.contains("markdown")
            || input
                .filename
                .and_then(super::extension)
                .is_some_and(|e| e == "md" || e == "markdown");
        if is_markdown {
            doc.metadata.title = markdown_title(&doc.text);
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_and_bom() {
        let (text, warning) = decode_text(b"\xEF\xBB\xBFh\xC3\xA9llo");
        assert_eq!(text, "héllo");
        assert!(warning.is_none());
    }

    #[test]
    fn latin1_fallback_warns() {
        let (text, warning) = decode_text(b"caf\xE9");
        assert_eq!(text, "café");
        assert!(warning.unwrap().contains("Latin-1"));
    }

    #[tokio::test]
    async fn markdown_heading_becomes_title() {
        let doc = TextHandler
            .extract(FileInput {
                bytes: b"intro\n# Field Notes\n\nbody",
                mime_type: MIME_MARKDOWN,
                filename: None,
            })
            .await
            .unwrap();
        assert_eq!(doc.metadata.title.as_deref(), Some("Field Notes"));
    }
}
