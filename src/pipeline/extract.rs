//! Extract: turn a fetched document into plain text.
//!
//! HTML bypasses OCR entirely and goes through [`crate::pipeline::html`].
//! PDF and image documents are checked against their magic bytes and handed
//! to the configured [`OcrEngine`]; the engine's text is cleaned and scored
//! against the confidence floor. When OCR is disabled for the run, those
//! documents are excluded by policy rather than failed.

use crate::error::{ExtractionError, PipelineError};
use crate::model::{DocumentKind, ExtractedText, ExtractionMethod, RawDocument};
use crate::pipeline::clean::{clean_ocr_text, estimate_confidence};
use crate::pipeline::html;
use crate::pipeline::ocr::{OcrEngine, OcrRequest};
use crate::store::ArtifactStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Share of U+FFFD replacement characters above which decoded HTML is
/// considered to be in an encoding we cannot read.
const MAX_REPLACEMENT_RATIO: f32 = 0.1;

/// Result of extracting one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Text(ExtractedText),
    /// Left out by run policy; not a failure.
    Excluded { reason: String },
}

/// MIME type implied by the leading bytes, if recognised.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Converts raw documents into [`ExtractedText`].
#[derive(Clone)]
pub struct Extractor {
    engine: Arc<dyn OcrEngine>,
    store: ArtifactStore,
    confidence_floor: f32,
}

impl Extractor {
    pub fn new(engine: Arc<dyn OcrEngine>, store: ArtifactStore, confidence_floor: f32) -> Self {
        Self {
            engine,
            store,
            confidence_floor,
        }
    }

    /// Extract text from one fetched document.
    ///
    /// The outer `Result` carries store failures; the inner one the per-item
    /// [`ExtractionError`].
    pub async fn extract(
        &self,
        doc: &RawDocument,
        allow_ocr: bool,
    ) -> Result<Result<Extraction, ExtractionError>, PipelineError> {
        if doc.kind.needs_ocr() && !allow_ocr {
            debug!("{}: OCR disabled, excluding", doc.source.url);
            return Ok(Ok(Extraction::Excluded {
                reason: "ocr_disabled".to_string(),
            }));
        }

        let bytes = self.store.get_document(&doc.content_hash).await?;
        let result = match doc.kind {
            DocumentKind::Html => extract_html(doc, &bytes),
            DocumentKind::Pdf | DocumentKind::Image => self.extract_ocr(doc, &bytes).await,
        };
        Ok(result.map(Extraction::Text))
    }

    async fn extract_ocr(&self, doc: &RawDocument, bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        let mime = sniff_mime(bytes).ok_or_else(|| ExtractionError::Unreadable {
            detail: format!("{} bytes with no recognised PDF or image signature", bytes.len()),
        })?;
        let sniffed_kind = if mime == "application/pdf" {
            DocumentKind::Pdf
        } else {
            DocumentKind::Image
        };
        if sniffed_kind != doc.kind {
            return Err(ExtractionError::Unreadable {
                detail: format!("declared {:?} but content is {mime}", doc.kind),
            });
        }

        let output = self
            .engine
            .recognize(OcrRequest {
                bytes,
                kind: doc.kind,
                mime,
                label: &doc.source.url,
            })
            .await?;

        let text = clean_ocr_text(&output.text);
        if text.is_empty() {
            return Err(ExtractionError::Empty);
        }

        let confidence = output
            .confidence
            .unwrap_or_else(|| estimate_confidence(&text))
            .clamp(0.0, 1.0);
        let low_confidence = confidence < self.confidence_floor;
        if low_confidence {
            warn!(
                "{}: OCR confidence {:.2} below floor {:.2}",
                doc.source.url, confidence, self.confidence_floor
            );
        }
        info!(
            "{}: OCR via {} ({} pages, {} chars, confidence {:.2})",
            doc.source.url,
            self.engine.name(),
            output.pages,
            text.chars().count(),
            confidence
        );

        Ok(ExtractedText {
            authority: doc.source.authority.clone(),
            source_url: doc.source.url.clone(),
            document_hash: doc.content_hash.clone(),
            method: ExtractionMethod::Ocr,
            text,
            confidence: Some(confidence),
            low_confidence,
            engine: Some(self.engine.name().to_string()),
        })
    }
}

fn extract_html(doc: &RawDocument, bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
    if sniff_mime(bytes).is_some() {
        return Err(ExtractionError::Unreadable {
            detail: "declared HTML but content is a binary document".to_string(),
        });
    }

    let decoded = String::from_utf8_lossy(bytes);
    let total = decoded.chars().count();
    let replaced = decoded.chars().filter(|&c| c == char::REPLACEMENT_CHARACTER).count();
    if total > 0 && replaced as f32 / total as f32 > MAX_REPLACEMENT_RATIO {
        return Err(ExtractionError::Unreadable {
            detail: "unsupported encoding".to_string(),
        });
    }

    let text = html::extract_text(&decoded);
    if text.trim().is_empty() {
        return Err(ExtractionError::Empty);
    }
    debug!("{}: {} lines of HTML text", doc.source.url, text.lines().count());

    Ok(ExtractedText {
        authority: doc.source.authority.clone(),
        source_url: doc.source.url.clone(),
        document_hash: doc.content_hash.clone(),
        method: ExtractionMethod::Html,
        text,
        confidence: None,
        low_confidence: false,
        engine: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use crate::pipeline::ocr::OcrOutput;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FixedEngine {
        text: String,
        confidence: Option<f32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for FixedEngine {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn recognize(&self, _request: OcrRequest<'_>) -> Result<OcrOutput, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(OcrOutput {
                text: self.text.clone(),
                confidence: self.confidence,
                pages: 1,
            })
        }
    }

    fn engine(text: &str, confidence: Option<f32>) -> Arc<FixedEngine> {
        Arc::new(FixedEngine {
            text: text.to_string(),
            confidence,
            calls: AtomicUsize::new(0),
        })
    }

    async fn stored(store: &ArtifactStore, url: &str, bytes: &[u8]) -> RawDocument {
        let (hash, _) = store.put_document(bytes).await.unwrap();
        let source = Source::new("jung", url);
        RawDocument {
            kind: source.kind,
            source,
            content_hash: hash,
            fetched_at: Utc::now(),
            status: 200,
            content_type: None,
            byte_len: bytes.len(),
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn sniffs_signatures() {
        assert_eq!(sniff_mime(b"%PDF-1.7\n"), Some("application/pdf"));
        assert_eq!(sniff_mime(b"\x89PNG\r\n\x1a\n...."), Some("image/png"));
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"<html>"), None);
    }

    #[tokio::test]
    async fn html_bypasses_ocr() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let fixed = engine("unused", None);
        let extractor = Extractor::new(fixed.clone(), store.clone(), 0.4);
        let doc = stored(&store, "https://jung.go.kr/n/1", "<p>402번 노선: 시청역 → 서울역</p>".as_bytes()).await;

        let Extraction::Text(text) = extractor.extract(&doc, true).await.unwrap().unwrap() else {
            panic!("expected text");
        };
        assert_eq!(text.method, ExtractionMethod::Html);
        assert_eq!(text.text, "402번 노선: 시청역 → 서울역");
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pdf_without_signature_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let extractor = Extractor::new(engine("x", Some(0.9)), store.clone(), 0.4);
        let doc = stored(&store, "https://jung.go.kr/f/route.pdf", b"not a pdf at all").await;

        let err = extractor.extract(&doc, true).await.unwrap().unwrap_err();
        assert_eq!(err.code(), "unreadable");
    }

    #[tokio::test]
    async fn low_confidence_tags_but_does_not_fail() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let extractor = Extractor::new(engine("시청역 → 서울역", Some(0.2)), store.clone(), 0.4);
        let doc = stored(&store, "https://jung.go.kr/f/route.pdf", b"%PDF-1.4 fake").await;

        let Extraction::Text(text) = extractor.extract(&doc, true).await.unwrap().unwrap() else {
            panic!("expected text");
        };
        assert!(text.low_confidence);
        assert_eq!(text.method, ExtractionMethod::Ocr);
        assert_eq!(text.engine.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn ocr_disabled_excludes_binary_documents() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let fixed = engine("x", None);
        let extractor = Extractor::new(fixed.clone(), store.clone(), 0.4);
        let doc = stored(&store, "https://jung.go.kr/f/map.png", b"\x89PNG\r\n\x1a\nxxxx").await;

        let outcome = extractor.extract(&doc, false).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Extraction::Excluded {
                reason: "ocr_disabled".into()
            }
        );
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_ocr_output_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let extractor = Extractor::new(engine("```\n\n```", None), store.clone(), 0.4);
        let doc = stored(&store, "https://jung.go.kr/f/map.png", b"\x89PNG\r\n\x1a\nxxxx").await;

        let err = extractor.extract(&doc, true).await.unwrap().unwrap_err();
        assert_eq!(err, ExtractionError::Empty);
    }

    #[test]
    fn undecodable_html_is_unreadable() {
        let source = Source::new("jung", "https://jung.go.kr/n/2");
        let doc = RawDocument {
            kind: DocumentKind::Html,
            source,
            content_hash: "h".into(),
            fetched_at: Utc::now(),
            status: 200,
            content_type: None,
            byte_len: 0,
            etag: None,
            last_modified: None,
        };
        // EUC-KR bytes for "시청역" repeated.
        let bytes: Vec<u8> = [0xBD, 0xC3, 0xC3, 0xBB, 0xBF, 0xAA].repeat(10);
        let err = extract_html(&doc, &bytes).unwrap_err();
        assert_eq!(
            err,
            ExtractionError::Unreadable {
                detail: "unsupported encoding".into()
            }
        );
    }
}
