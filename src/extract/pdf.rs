//! PDF text via `pdf-extract`, run on the blocking pool.

use async_trait::async_trait;

use super::{ExtractedDocument, FileInput, FormatHandler};
use crate::error::ExtractError;

pub const MIME_PDF: &str = "application/pdf";

pub struct PdfHandler;

pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractError::ExtractionFailed(format!("PDF: {}", e)))
}

#[async_trait]
impl FormatHandler for PdfHandler {
    fn name(&self) -> &str {
        "pdf"
    }

    fn mime_types(&self) -> &[&'static str] {
        &[MIME_PDF]
    }

    fn extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    async fn extract(&self, input: FileInput<'_>) -> Result<ExtractedDocument, ExtractError> {
        let bytes = input.bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || extract_pdf_text(&bytes))
            .await
            .map_err(|e| ExtractError::ExtractionFailed(format!("PDF worker: {}", e)))??;

        if text.trim().is_empty() {
            return Err(ExtractError::ExtractionFailed(
                "PDF contains no extractable text (scanned images are not OCR'd)".to_string(),
            ));
        }
        // Form feeds separate pages.
        let pages = text.matches('\u{c}').count() + 1;
        let text = text.replace('\u{c}', "\n\n");
        Ok(ExtractedDocument::new(text)
            .with_warning(format!("layout of {} page(s) flattened; images and tables not preserved", pages)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_pdf_fails() {
        let err = PdfHandler
            .extract(FileInput {
                bytes: b"not a pdf",
                mime_type: MIME_PDF,
                filename: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed(_)));
    }
}
