//! Error types for the shuttle-routes pipeline.
//!
//! Two families of errors reflect two distinct failure modes:
//!
//! * [`PipelineError`] is **fatal**: the run cannot proceed or must not
//!   publish (missing upstream artifacts, failure-rate abort, store I/O).
//!
//! * [`FetchError`], [`ExtractionError`] and [`StructuringError`] are
//!   **per-item**: one document failed, every other document is fine. They are
//!   recorded in the [`crate::report::RunReport`] and the affected item is left
//!   out of downstream artifacts.
//!
//! Per-item errors are `Serialize` so they can be written verbatim into the
//! append-only run log.

use crate::config::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Orchestration ─────────────────────────────────────────────────────
    /// A selected stage needs artifacts from a stage that was neither run now
    /// nor recorded in the current generation.
    #[error("Stage '{stage}' requires '{requires}' artifacts, but none are recorded.\nRun '{requires}' first or include it in --stages.")]
    MissingDependency { stage: Stage, requires: Stage },

    /// The run stopped before Publish; the previous dataset is intact.
    #[error("Publish aborted: {reason}")]
    PublishAborted { reason: AbortReason },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The source catalog could not be read or parsed.
    #[error("Source catalog '{path}' is invalid: {detail}")]
    SourceCatalog { path: PathBuf, detail: String },

    // ── Store errors ──────────────────────────────────────────────────────
    /// Reading or writing the artifact store failed.
    #[error("Store I/O failed at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted artifact could not be encoded or decoded.
    #[error("Artifact '{path}' is not valid JSON: {detail}")]
    Serialization { path: PathBuf, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Store {
            path: path.into(),
            source,
        }
    }
}

/// Why a run stopped short of publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// More than the configured share of a stage's items failed.
    FailureRateExceeded {
        stage: Stage,
        failed: usize,
        considered: usize,
        threshold: f64,
    },
    /// Validation left no route eligible for publication.
    NothingToPublish,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::FailureRateExceeded {
                stage,
                failed,
                considered,
                threshold,
            } => write!(
                f,
                "failure rate exceeded in {stage}: {failed}/{considered} items failed (threshold {:.0}%)",
                threshold * 100.0
            ),
            AbortReason::NothingToPublish => write!(f, "no route passed validation"),
        }
    }
}

// ── Per-item errors ──────────────────────────────────────────────────────────

/// A single fetch (or geocoding call) failed after all retries.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    /// The request did not complete within the configured timeout.
    #[error("timed out after {secs}s fetching '{url}'")]
    Timeout { url: String, secs: u64 },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from '{url}'")]
    HttpStatus { url: String, status: u16 },

    /// The server refused us outright (403/451) or the connection failed.
    #[error("blocked fetching '{url}': {reason}")]
    Blocked { url: String, reason: String },
}

impl FetchError {
    /// Transient failures are retried with backoff; everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            FetchError::Blocked { .. } => false,
        }
    }

    /// Short machine-readable reason code for the run report.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::HttpStatus { .. } => "http_status",
            FetchError::Blocked { .. } => "blocked",
        }
    }
}

/// Text could not be obtained from a raw document.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    /// The bytes are not a document the extractor can open.
    #[error("unreadable document: {detail}")]
    Unreadable { detail: String },

    /// The document opened but yielded no text.
    #[error("document yielded no text")]
    Empty,

    /// The OCR engine could not be reached or is not configured.
    #[error("OCR engine '{engine}' unavailable: {detail}")]
    EngineUnavailable { engine: String, detail: String },
}

impl ExtractionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractionError::Unreadable { .. } => "unreadable",
            ExtractionError::Empty => "empty",
            ExtractionError::EngineUnavailable { .. } => "engine_unavailable",
        }
    }

    /// Deterministic failures are cached like successes; engine outages are not.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, ExtractionError::EngineUnavailable { .. })
    }
}

/// Text could not be segmented into any stop candidates.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuringError {
    #[error("no route or stop pattern matched in {lines} lines of text")]
    NoPatternMatch { lines: usize },
}

impl StructuringError {
    pub fn code(&self) -> &'static str {
        match self {
            StructuringError::NoPatternMatch { .. } => "no_pattern_match",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_display() {
        let e = PipelineError::MissingDependency {
            stage: Stage::Resolve,
            requires: Stage::Structure,
        };
        let msg = e.to_string();
        assert!(msg.contains("resolve"), "got: {msg}");
        assert!(msg.contains("structure"), "got: {msg}");
    }

    #[test]
    fn abort_reason_display() {
        let e = PipelineError::PublishAborted {
            reason: AbortReason::FailureRateExceeded {
                stage: Stage::Extract,
                failed: 3,
                considered: 4,
                threshold: 0.5,
            },
        };
        let msg = e.to_string();
        assert!(msg.contains("3/4"), "got: {msg}");
        assert!(msg.contains("50%"), "got: {msg}");
    }

    #[test]
    fn transient_classification() {
        let t = FetchError::Timeout {
            url: "u".into(),
            secs: 15,
        };
        assert!(t.is_transient());
        let s503 = FetchError::HttpStatus {
            url: "u".into(),
            status: 503,
        };
        assert!(s503.is_transient());
        let s404 = FetchError::HttpStatus {
            url: "u".into(),
            status: 404,
        };
        assert!(!s404.is_transient());
        let blocked = FetchError::Blocked {
            url: "u".into(),
            reason: "403".into(),
        };
        assert!(!blocked.is_transient());
    }

    #[test]
    fn per_item_errors_serialise_with_kind_tag() {
        let e = ExtractionError::Unreadable {
            detail: "bad magic".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"unreadable\""), "got: {json}");
        assert_eq!(e.code(), "unreadable");
    }

    #[test]
    fn engine_outage_is_not_cached() {
        assert!(!ExtractionError::EngineUnavailable {
            engine: "vlm".into(),
            detail: "no key".into()
        }
        .is_deterministic());
        assert!(ExtractionError::Empty.is_deterministic());
    }
}
