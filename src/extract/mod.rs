//! Content extraction: turn a [`SourceDescriptor`] into plain text.
//!
//! Files are dispatched through a registry of [`FormatHandler`]s keyed by
//! MIME type and file extension. When no MIME type is declared (or it is
//! `application/octet-stream`) the type is sniffed from the bytes with
//! `infer`, then guessed from the extension, then assumed to be plain text
//! if the bytes decode as UTF-8. URLs are fetched and dispatched the same
//! way using the response `Content-Type`.
//!
//! Extraction is best effort: whatever structure a handler cannot keep
//! (tables, layout, numeric cells) is reported in
//! [`ExtractedDocument::warnings`] rather than failing the source.
//!
//! | Handler | MIME types | Extensions |
//! |---------|-----------|------------|
//! | [`text::TextHandler`] | `text/plain`, `text/markdown`, `text/csv`, `application/json` | txt, md, csv, json, ... |
//! | [`html::HtmlHandler`] | `text/html`, `application/xhtml+xml` | html, htm |
//! | [`pdf::PdfHandler`] | `application/pdf` | pdf |
//! | [`office::OfficeHandler`] | docx, pptx, xlsx | docx, pptx, xlsx |
//! | [`audio::AudioHandler`] | `audio/*` | mp3, wav, m4a, ... |

pub mod audio;
pub mod html;
pub mod office;
pub mod pdf;
pub mod text;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::Config;
use crate::error::ExtractError;
use crate::models::{SourceDescriptor, SourceMetadata};
use crate::providers::ProviderRegistry;

use self::web::WebFetcher;

pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Plain text plus what was learned about the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedDocument {
    pub text: String,
    pub metadata: SourceMetadata,
    pub warnings: Vec<String>,
}

impl ExtractedDocument {
    pub fn new(text: String) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Bytes handed to a [`FormatHandler`].
#[derive(Debug, Clone, Copy)]
pub struct FileInput<'a> {
    pub bytes: &'a [u8],
    pub mime_type: &'a str,
    pub filename: Option<&'a str>,
}

/// Converts one family of formats to text.
#[async_trait]
pub trait FormatHandler: Send + Sync {
    fn name(&self) -> &str;

    fn mime_types(&self) -> &[&'static str];

    fn extensions(&self) -> &[&'static str];

    async fn extract(&self, input: FileInput<'_>) -> Result<ExtractedDocument, ExtractError>;
}

pub struct Extractor {
    handlers: Vec<Arc<dyn FormatHandler>>,
    by_mime: HashMap<String, usize>,
    by_extension: HashMap<String, usize>,
    fetcher: WebFetcher,
    max_bytes: usize,
}

impl Extractor {
    /// An extractor with no handlers registered.
    pub fn new(fetcher: WebFetcher, max_bytes: usize) -> Self {
        Self {
            handlers: Vec::new(),
            by_mime: HashMap::new(),
            by_extension: HashMap::new(),
            fetcher,
            max_bytes,
        }
    }

    /// An extractor with every built-in handler. Audio transcription goes
    /// through the registry's `transcription` role.
    pub fn with_defaults(
        config: &Config,
        registry: Arc<ProviderRegistry>,
    ) -> anyhow::Result<Self> {
        let fetcher = WebFetcher::new(config.ingest.fetch_timeout_secs, config.ingest.max_bytes)?;
        let mut extractor = Self::new(fetcher, config.ingest.max_bytes);
        extractor.register(Arc::new(text::TextHandler));
        extractor.register(Arc::new(html::HtmlHandler));
        extractor.register(Arc::new(pdf::PdfHandler));
        extractor.register(Arc::new(office::OfficeHandler));
        extractor.register(Arc::new(audio::AudioHandler::new(registry)));
        Ok(extractor)
    }

    /// Add a handler. Later registrations win for shared keys.
    pub fn register(&mut self, handler: Arc<dyn FormatHandler>) {
        let index = self.handlers.len();
        for mime in handler.mime_types() {
            self.by_mime.insert(mime.to_string(), index);
        }
        for ext in handler.extensions() {
            self.by_extension.insert(ext.to_string(), index);
        }
        self.handlers.push(handler);
    }

    /// Handler for a MIME type, falling back to the filename's extension.
    pub fn handler_for(
        &self,
        mime_type: &str,
        filename: Option<&str>,
    ) -> Option<Arc<dyn FormatHandler>> {
        self.by_mime
            .get(mime_type)
            .or_else(|| filename.and_then(extension).and_then(|ext| self.by_extension.get(&ext)))
            .map(|&i| Arc::clone(&self.handlers[i]))
    }

    pub async fn extract(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<ExtractedDocument, ExtractError> {
        match descriptor {
            SourceDescriptor::Text { text, title } => {
                if text.trim().is_empty() {
                    return Err(ExtractError::InvalidInput(
                        "text source is empty".to_string(),
                    ));
                }
                let mut doc = ExtractedDocument::new(text.clone());
                doc.metadata.title = title.clone();
                doc.metadata.mime_type = Some(text::MIME_TEXT.to_string());
                Ok(doc)
            }
            SourceDescriptor::Url(url) => {
                let page = self.fetcher.fetch(url).await?;
                let filename = page.url_filename();
                let mime = detect_mime(&page.bytes, page.content_type.as_deref(), filename.as_deref());
                let mut doc = self
                    .extract_file(&page.bytes, &mime, filename.as_deref())
                    .await?;
                doc.metadata.url = Some(url.clone());
                doc.metadata.title = doc.metadata.title.or(Some(url.clone()));
                Ok(doc)
            }
            SourceDescriptor::File {
                bytes,
                mime_type,
                filename,
            } => {
                if bytes.is_empty() {
                    return Err(ExtractError::InvalidInput("file is empty".to_string()));
                }
                if bytes.len() > self.max_bytes {
                    return Err(ExtractError::InvalidInput(format!(
                        "file is {} bytes, limit is {}",
                        bytes.len(),
                        self.max_bytes
                    )));
                }
                let mime = detect_mime(bytes, mime_type.as_deref(), filename.as_deref());
                let mut doc = self.extract_file(bytes, &mime, filename.as_deref()).await?;
                doc.metadata.filename = filename.clone();
                if doc.metadata.title.is_none() {
                    doc.metadata.title = filename.clone();
                }
                Ok(doc)
            }
        }
    }

    async fn extract_file(
        &self,
        bytes: &[u8],
        mime_type: &str,
        filename: Option<&str>,
    ) -> Result<ExtractedDocument, ExtractError> {
        let handler = self
            .handler_for(mime_type, filename)
            .ok_or_else(|| ExtractError::UnsupportedFormat(mime_type.to_string()))?;
        debug!(handler = handler.name(), mime = mime_type, "extracting");

        let mut doc = handler
            .extract(FileInput {
                bytes,
                mime_type,
                filename,
            })
            .await?;
        doc.metadata.mime_type = Some(mime_type.to_string());
        Ok(doc)
    }
}

/// Lowercased extension of a filename or URL path.
pub fn extension(name: &str) -> Option<String> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Resolve the MIME type of some bytes.
///
/// A declared type wins unless it is generic. Otherwise the type is sniffed
/// from magic bytes, then guessed from the extension; bytes that decode as
/// UTF-8 are treated as plain text.
pub fn detect_mime(bytes: &[u8], declared: Option<&str>, filename: Option<&str>) -> String {
    if let Some(declared) = declared.map(normalize_mime) {
        if !declared.is_empty() && declared != MIME_OCTET_STREAM {
            return declared;
        }
    }
    if let Some(kind) = infer::get(bytes) {
        // OOXML files sniff as plain zip unless the extension says more.
        if kind.mime_type() != "application/zip" {
            return kind.mime_type().to_string();
        }
    }
    if let Some(mime) = filename
        .and_then(extension)
        .and_then(|ext| mime_for_extension(&ext))
    {
        return mime.to_string();
    }
    if std::str::from_utf8(bytes).is_ok() {
        return text::MIME_TEXT.to_string();
    }
    MIME_OCTET_STREAM.to_string()
}

/// Strip parameters (`; charset=...`) and lowercase.
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or(mime)
        .trim()
        .to_ascii_lowercase()
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "txt" | "log" | "rst" => text::MIME_TEXT,
        "md" | "markdown" => text::MIME_MARKDOWN,
        "csv" => text::MIME_CSV,
        "json" => text::MIME_JSON,
        "html" | "htm" => html::MIME_HTML,
        "pdf" => pdf::MIME_PDF,
        "docx" => office::MIME_DOCX,
        "pptx" => office::MIME_PPTX,
        "xlsx" => office::MIME_XLSX,
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        let mut extractor = Extractor::new(WebFetcher::new(5, 1024 * 1024).unwrap(), 1024);
        extractor.register(Arc::new(text::TextHandler));
        extractor.register(Arc::new(html::HtmlHandler));
        extractor
    }

    #[test]
    fn mime_detection_order() {
        assert_eq!(
            detect_mime(b"hello", Some("text/markdown; charset=utf-8"), None),
            "text/markdown"
        );
        assert_eq!(detect_mime(b"%PDF-1.7 ...", None, Some("x.bin")), pdf::MIME_PDF);
        assert_eq!(detect_mime(b"PK\x03\x04rest", None, Some("deck.pptx")), office::MIME_PPTX);
        assert_eq!(detect_mime(b"plain words", Some(MIME_OCTET_STREAM), None), "text/plain");
        assert_eq!(detect_mime(&[0xff, 0xfe, 0x00, 0x81], None, None), MIME_OCTET_STREAM);
    }

    #[test]
    fn extension_parsing() {
        assert_eq!(extension("notes/Report.PDF").as_deref(), Some("pdf"));
        assert_eq!(extension(".bashrc"), None);
        assert_eq!(extension("README"), None);
    }

    #[tokio::test]
    async fn text_descriptor_passes_through() {
        let doc = extractor()
            .extract(&SourceDescriptor::Text {
                text: "Some pasted text.".into(),
                title: Some("Paste".into()),
            })
            .await
            .unwrap();
        assert_eq!(doc.text, "Some pasted text.");
        assert_eq!(doc.metadata.title.as_deref(), Some("Paste"));
    }

    #[tokio::test]
    async fn empty_text_rejected() {
        let err = extractor()
            .extract(&SourceDescriptor::Text {
                text: "  \n".into(),
                title: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_binary_is_unsupported() {
        let err = extractor()
            .extract(&SourceDescriptor::File {
                bytes: vec![0xff, 0xfe, 0x00, 0x81],
                mime_type: None,
                filename: Some("blob.bin".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn oversized_file_rejected() {
        let err = extractor()
            .extract(&SourceDescriptor::File {
                bytes: vec![b'a'; 2048],
                mime_type: Some("text/plain".into()),
                filename: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn extension_used_when_mime_unknown() {
        let doc = extractor()
            .extract(&SourceDescriptor::File {
                bytes: b"<html><head><title>T</title></head><body><p>Body</p></body></html>".to_vec(),
                mime_type: Some("application/x-unknown".into()),
                filename: Some("page.html".into()),
            })
            .await
            .unwrap();
        assert!(doc.text.contains("Body"));
        assert_eq!(doc.metadata.title.as_deref(), Some("T"));
        assert_eq!(doc.metadata.filename.as_deref(), Some("page.html"));
    }
}
