//! The OCR capability consumed by the extractor.
//!
//! Engines receive the raw bytes of a PDF or image document and return plain
//! text plus an optional confidence. The vision-LLM engine
//! ([`crate::pipeline::vision::VisionOcrEngine`]) is the default when the
//! `vlm-ocr` feature is enabled; tests plug in scripted engines.

use crate::error::ExtractionError;
use crate::model::DocumentKind;
use async_trait::async_trait;

/// One document handed to an OCR engine.
#[derive(Debug, Clone, Copy)]
pub struct OcrRequest<'a> {
    pub bytes: &'a [u8],
    /// `Pdf` or `Image`; HTML never reaches an engine.
    pub kind: DocumentKind,
    /// MIME type detected from magic bytes, e.g. `image/png`.
    pub mime: &'a str,
    /// Identifier for logs (source URL).
    pub label: &'a str,
}

/// What an engine recognised.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Engine-reported confidence in [0,1], if the engine has one.
    pub confidence: Option<f32>,
    /// Pages processed (1 for images).
    pub pages: usize,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Short engine identifier recorded on the extracted text.
    fn name(&self) -> &str;

    async fn recognize(&self, request: OcrRequest<'_>) -> Result<OcrOutput, ExtractionError>;
}

/// Stand-in used when no engine is configured or the default one could not
/// be built: every request fails as `engine_unavailable`.
#[derive(Debug, Clone)]
pub struct UnavailableOcrEngine {
    detail: String,
}

impl UnavailableOcrEngine {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for UnavailableOcrEngine {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn recognize(&self, _request: OcrRequest<'_>) -> Result<OcrOutput, ExtractionError> {
        Err(ExtractionError::EngineUnavailable {
            engine: self.name().to_string(),
            detail: self.detail.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_engine_is_not_deterministic() {
        let engine = UnavailableOcrEngine::new("no provider configured");
        let err = engine
            .recognize(OcrRequest {
                bytes: b"%PDF-1.4",
                kind: DocumentKind::Pdf,
                mime: "application/pdf",
                label: "t",
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine_unavailable");
        assert!(!err.is_deterministic());
    }
}
