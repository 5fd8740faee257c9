//! # shuttle-routes
//!
//! Turn Seoul municipal free-shuttle announcements into a geocoded route
//! dataset for a map page.
//!
//! ## Why this crate?
//!
//! District offices publish shuttle routes as notice-board pages, PDF
//! attachments and scanned timetables, each laid out differently. Stop names
//! are informal ("시청역 3번 출구", "주민센터 앞") and change without notice.
//! This crate fetches the announcements, reads them (OCR where needed),
//! recognises stop sequences, geocodes each stop within its district, applies
//! validation rules and publishes a dataset only when the result actually
//! changed. Every run leaves a report explaining what was dropped and why.
//!
//! ## Pipeline Overview
//!
//! ```text
//! catalog.toml
//!  │
//!  ├─ 1. Discover   expand the source catalog into URLs
//!  ├─ 2. Fetch      conditional GET, bytes stored by SHA-256
//!  ├─ 3. Extract    HTML text, or OCR for PDFs and images
//!  ├─ 4. Structure  stop sequences, hours and intervals from text
//!  ├─ 5. Resolve    cached geocoding with district disambiguation
//!  ├─ 6. Validate   accept / flag / reject each route and stop
//!  └─ 7. Publish    data/published/routes.json, only if its hash changed
//! ```
//!
//! Each stage skips inputs it has already processed, so re-running over
//! unchanged sources does no work and publishes nothing new.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shuttle_routes::{run, PipelineConfig, RunConfig, SourceCatalog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = SourceCatalog::load("catalog.toml").await?;
//!     let config = PipelineConfig::builder().data_dir("data").build()?;
//!     let report = run(&catalog, &config, &RunConfig::full()).await?;
//!     eprintln!("{:?} ({} items discarded)", report.outcome, report.discards.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `shuttle-routes` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `vlm-ocr` | on      | Vision-LLM OCR for PDFs and images (pdfium + edgequake-llm) |
//!
//! Without `vlm-ocr`, supply your own [`pipeline::ocr::OcrEngine`] through
//! [`PipelineConfigBuilder::ocr_engine`] or run in [`RunMode::Quick`]:
//! ```toml
//! shuttle-routes = { version = "0.3", default-features = false }
//! ```
//!
//! ## Environment
//!
//! | Variable | Used by |
//! |----------|---------|
//! | `KAKAO_API_KEY` | Kakao Local keyword search; without it only the built-in landmark table geocodes |
//! | `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` / `GEMINI_API_KEY` | VLM OCR provider auto-detection |
//! | `PDFIUM_LIB_PATH` | Location of the pdfium shared library |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;
pub mod report;
pub mod sources;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, RunConfig, RunMode, Stage, StageSet};
pub use error::{AbortReason, ExtractionError, FetchError, PipelineError, StructuringError};
pub use model::{PublishedRoute, PublishedStop, Verdict};
pub use orchestrator::{run, run_sync};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use report::{DatasetQuality, Discard, PublishOutcome, RunOutcome, RunReport, StageReport, StageState};
pub use sources::{Authority, SourceCatalog};
pub use store::ArtifactStore;
