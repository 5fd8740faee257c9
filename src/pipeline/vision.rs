//! Vision-LLM OCR engine backed by `edgequake-llm`.
//!
//! PDFs are rasterised page by page ([`crate::pipeline::render`]), each page
//! is PNG-encoded and sent to a vision-capable chat model together with a
//! transcription prompt. Images are sent as-is with their detected MIME type.
//! The model reports no confidence; the extractor cleans the transcription
//! and falls back to a text-quality estimate.
//!
//! ## Provider resolution
//!
//! From most to least specific:
//!
//! 1. a provider name passed explicitly (CLI `--provider`), with an optional
//!    model;
//! 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
//! 3. OpenAI when `OPENAI_API_KEY` is present;
//! 4. whatever [`ProviderFactory::from_env`] detects.

use crate::error::ExtractionError;
use crate::model::DocumentKind;
use crate::pipeline::ocr::{OcrEngine, OcrOutput, OcrRequest};
use crate::pipeline::render::render_pdf;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// System prompt for transcribing one page of a shuttle notice.
pub const TRANSCRIPTION_PROMPT: &str = r#"You transcribe Korean municipal notices about free shuttle buses.

Rules:
1. Output ONLY the text visible in the image, in natural reading order.
2. Keep route names, stop names, arrows (→) and numbering exactly as printed.
3. Write one route per line when stops are drawn as a chain or a map path:
   "402번 노선: 시청역 → 서울역 → 용산역".
4. For timetables, write one row per line with cells separated by spaces.
5. Keep operating hours and intervals (e.g. "09:00~18:00", "20분 간격").
6. Do NOT translate, summarise, or add commentary.
7. Do NOT wrap the output in code fences."#;

/// OCR through a vision-capable chat model.
pub struct VisionOcrEngine {
    provider: Arc<dyn LLMProvider>,
    name: String,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl VisionOcrEngine {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        provider_label: &str,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            provider,
            name: format!("vlm:{provider_label}"),
            max_retries,
            retry_backoff_ms,
        }
    }

    /// Build an engine from an explicit provider name or the environment.
    pub fn from_env(
        provider_name: Option<&str>,
        model: Option<&str>,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self, ExtractionError> {
        let (provider, label) = resolve_provider(provider_name, model)?;
        Ok(Self::new(provider, &label, max_retries, retry_backoff_ms))
    }

    /// Transcribe one page image, retrying provider errors with backoff.
    async fn transcribe(&self, label: &str, page: usize, image: ImageData) -> Result<String, ExtractionError> {
        let messages = vec![
            ChatMessage::system(TRANSCRIPTION_PROMPT),
            ChatMessage::user_with_images("", vec![image]),
        ];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(4096),
            ..Default::default()
        };

        let start = Instant::now();
        let mut last_err = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{} page {}: retry {}/{} after {}ms",
                    label, page, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "{} page {}: {} input tokens, {} output tokens, {:?}",
                        label,
                        page,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    warn!("{} page {}: attempt {} failed: {}", label, page, attempt + 1, e);
                    last_err = e.to_string();
                }
            }
        }

        Err(ExtractionError::EngineUnavailable {
            engine: self.name.clone(),
            detail: format!("page {page}: {last_err}"),
        })
    }
}

#[async_trait]
impl OcrEngine for VisionOcrEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, request: OcrRequest<'_>) -> Result<OcrOutput, ExtractionError> {
        let pages: Vec<ImageData> = match request.kind {
            DocumentKind::Pdf => render_pdf(request.bytes.to_vec(), request.label.to_string())
                .await?
                .iter()
                .map(encode_page)
                .collect::<Result<_, _>>()
                .map_err(|e| ExtractionError::Unreadable {
                    detail: format!("page could not be encoded: {e}"),
                })?,
            _ => vec![ImageData::new(STANDARD.encode(request.bytes), request.mime).with_detail("high")],
        };

        let mut texts = Vec::with_capacity(pages.len());
        for (idx, image) in pages.into_iter().enumerate() {
            let raw = self.transcribe(request.label, idx + 1, image).await?;
            if !raw.trim().is_empty() {
                texts.push(raw);
            }
        }

        Ok(OcrOutput {
            pages: texts.len().max(1),
            text: texts.join("\n\n"),
            confidence: None,
        })
    }
}

/// Encode a rasterised page as a base64 PNG.
///
/// PNG keeps glyph edges crisp; JPEG artefacts around small Hangul confuse
/// vision models. `detail: "high"` lets the model tile the full page.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

fn create_provider(name: &str, model: &str) -> Result<(Arc<dyn LLMProvider>, String), ExtractionError> {
    ProviderFactory::create_llm_provider(name, model)
        .map(|p| (p, format!("{name}/{model}")))
        .map_err(|e| ExtractionError::EngineUnavailable {
            engine: format!("vlm:{name}"),
            detail: e.to_string(),
        })
}

/// Resolve the provider and a `name/model` label for reports.
fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<(Arc<dyn LLMProvider>, String), ExtractionError> {
    if let Some(name) = provider_name {
        return create_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model.unwrap_or(DEFAULT_MODEL));
    }

    let (llm, _embedding) = ProviderFactory::from_env().map_err(|e| ExtractionError::EngineUnavailable {
        engine: "vlm:auto".to_string(),
        detail: format!(
            "no vision provider could be detected; set OPENAI_API_KEY or pass --provider ({e})"
        ),
    })?;
    Ok((llm, "auto".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encodes_png_base64() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[..4], b"\x89PNG");
    }

    #[test]
    fn prompt_asks_for_arrow_chains() {
        assert!(TRANSCRIPTION_PROMPT.contains("→"));
        assert!(TRANSCRIPTION_PROMPT.contains("code fences"));
    }
}
