//! Stage implementations.
//!
//! Each submodule implements one transformation step; the orchestrator
//! decides what runs, feeds it cached or fresh inputs and records the result.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ extract ──▶ structure ──▶ resolve ──▶ validate ──▶ publish
//! (HTTP)    (html/OCR)   (patterns)    (geocode)   (rules)      (JSON)
//! ```
//!
//! 1. [`fetch`]: conditional GET with retry; bytes land in the store
//! 2. [`extract`]: HTML text directly, PDFs and images through an
//!    [`ocr::OcrEngine`]; [`clean`] normalises OCR output
//! 3. [`structure`]: line patterns turn text into candidate stops
//! 4. [`resolve`]: cached, rate-limited geocoding with area
//!    disambiguation; [`kakao`] and [`landmarks`] are the providers
//! 5. [`validate`]: per-route and per-stop verdicts
//! 6. [`publish`]: deterministic dataset, written only on change
//!
//! [`render`] and [`vision`] form the VLM OCR backend and are compiled only
//! with the `vlm-ocr` feature.

pub mod clean;
pub mod extract;
pub mod fetch;
pub mod html;
pub mod kakao;
pub mod landmarks;
pub mod ocr;
pub mod publish;
#[cfg(feature = "vlm-ocr")]
pub mod render;
pub mod resolve;
pub mod retry;
pub mod structure;
pub mod validate;
#[cfg(feature = "vlm-ocr")]
pub mod vision;
