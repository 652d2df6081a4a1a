//! Page text extraction
//!
//! The upload coordinator drives extraction page by page so it can report
//! progress after each one.
//!
//! - [`PdfExtractor`] reads text-based PDFs, one page per PDF page.
//! - [`PagedTextExtractor`] reads UTF-8 text documents whose pages are
//!   separated by form feed characters.
//! - [`DocumentExtractor`] sniffs the upload and hands it to one of the two.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Page separator for plain text documents
pub const FORM_FEED: u8 = 0x0C;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Page {page} could not be decoded: {reason}")]
    Decode { page: usize, reason: String },

    #[error("Extraction failed: {0}")]
    Failed(String),
}

/// Document → pages → text
#[async_trait]
pub trait PageExtractor: Send + Sync {
    /// Reject documents this extractor cannot read
    fn check_format(&self, document: &[u8]) -> Result<(), ExtractionError>;

    /// Split a document into raw pages, in page order
    async fn split_pages(&self, document: &[u8]) -> Result<Vec<Vec<u8>>, ExtractionError>;

    /// Extract the text of one page (`page_number` is 1-based)
    async fn extract_page(&self, page_number: usize, page: &[u8]) -> Result<String, ExtractionError>;
}

/// Extractor for form-feed paginated UTF-8 text
#[derive(Debug, Default, Clone)]
pub struct PagedTextExtractor;

impl PagedTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PageExtractor for PagedTextExtractor {
    fn check_format(&self, document: &[u8]) -> Result<(), ExtractionError> {
        if let Some(kind) = infer::get(document) {
            if kind.matcher_type() != infer::MatcherType::Text {
                return Err(ExtractionError::UnsupportedFormat(kind.mime_type().to_string()));
            }
        }
        if document.contains(&0u8) {
            return Err(ExtractionError::UnsupportedFormat(
                "application/octet-stream".to_string(),
            ));
        }
        Ok(())
    }

    async fn split_pages(&self, document: &[u8]) -> Result<Vec<Vec<u8>>, ExtractionError> {
        let mut pages: Vec<Vec<u8>> = document
            .split(|b| *b == FORM_FEED)
            .map(|page| page.to_vec())
            .collect();

        // A trailing form feed ends the last page rather than starting a new one
        if pages.len() > 1 && pages.last().is_some_and(|p| p.iter().all(u8::is_ascii_whitespace)) {
            pages.pop();
        }

        Ok(pages)
    }

    async fn extract_page(&self, page_number: usize, page: &[u8]) -> Result<String, ExtractionError> {
        decode_page(page_number, page)
    }
}

fn decode_page(page_number: usize, page: &[u8]) -> Result<String, ExtractionError> {
    let text = std::str::from_utf8(page).map_err(|e| ExtractionError::Decode {
        page: page_number,
        reason: e.to_string(),
    })?;
    Ok(text.trim().to_string())
}

const PDF_MIME: &str = "application/pdf";

fn is_pdf(document: &[u8]) -> bool {
    infer::get(document).is_some_and(|kind| kind.mime_type() == PDF_MIME)
}

/// Extractor for text-based PDFs
///
/// Scanned PDFs have no text layer; their pages come out blank and are
/// completed without narration.
#[derive(Debug, Default, Clone)]
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PageExtractor for PdfExtractor {
    fn check_format(&self, document: &[u8]) -> Result<(), ExtractionError> {
        if is_pdf(document) {
            return Ok(());
        }
        let mime = infer::get(document).map_or("text/plain", |kind| kind.mime_type());
        Err(ExtractionError::UnsupportedFormat(mime.to_string()))
    }

    async fn split_pages(&self, document: &[u8]) -> Result<Vec<Vec<u8>>, ExtractionError> {
        let bytes = document.to_vec();
        // The parser is CPU-bound and can panic on malformed input
        let pages = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&bytes))
            .await
            .map_err(|e| ExtractionError::Failed(format!("PDF parser aborted: {}", e)))?
            .map_err(|e| ExtractionError::Failed(format!("PDF could not be read: {}", e)))?;

        debug!(pages = pages.len(), "PDF split into pages");
        Ok(pages.into_iter().map(String::into_bytes).collect())
    }

    async fn extract_page(&self, page_number: usize, page: &[u8]) -> Result<String, ExtractionError> {
        decode_page(page_number, page)
    }
}

/// Picks the PDF or paged-text extractor by sniffing the document
#[derive(Debug, Default, Clone)]
pub struct DocumentExtractor {
    pdf: PdfExtractor,
    text: PagedTextExtractor,
}

impl DocumentExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick(&self, document: &[u8]) -> &dyn PageExtractor {
        if is_pdf(document) {
            &self.pdf
        } else {
            &self.text
        }
    }
}

#[async_trait]
impl PageExtractor for DocumentExtractor {
    fn check_format(&self, document: &[u8]) -> Result<(), ExtractionError> {
        self.pick(document).check_format(document)
    }

    async fn split_pages(&self, document: &[u8]) -> Result<Vec<Vec<u8>>, ExtractionError> {
        self.pick(document).split_pages(document).await
    }

    // Raw pages from either extractor are UTF-8 text
    async fn extract_page(&self, page_number: usize, page: &[u8]) -> Result<String, ExtractionError> {
        decode_page(page_number, page)
    }
}
