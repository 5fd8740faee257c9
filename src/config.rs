//! Configuration types for a pipeline run.
//!
//! Two structs split the knobs by lifetime:
//!
//! * [`PipelineConfig`] holds the static tuning of the pipeline: where the
//!   artifact store lives, how many workers each stage gets, retry policy,
//!   thresholds and the pluggable capabilities (OCR engine, geocoder, HTTP
//!   transport). Built via [`PipelineConfig::builder()`].
//!
//! * [`RunConfig`] is the per-invocation control object: which stages to run,
//!   whether OCR is allowed, whether flagged routes get published and the
//!   failure-rate abort threshold.

use crate::error::PipelineError;
use crate::pipeline::fetch::HttpTransport;
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::resolve::GeocodeProvider;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Default browser-like user agent; several district sites reject unknown agents.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// ── Stages ───────────────────────────────────────────────────────────────────

/// One step of the pipeline chain, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Fetch,
    Extract,
    Structure,
    Resolve,
    Validate,
    Publish,
}

impl Stage {
    /// The full chain in execution order.
    pub const ALL: [Stage; 7] = [
        Stage::Discover,
        Stage::Fetch,
        Stage::Extract,
        Stage::Structure,
        Stage::Resolve,
        Stage::Validate,
        Stage::Publish,
    ];

    /// The stage whose artifacts this stage consumes.
    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::Discover => None,
            Stage::Fetch => Some(Stage::Discover),
            Stage::Extract => Some(Stage::Fetch),
            Stage::Structure => Some(Stage::Extract),
            Stage::Resolve => Some(Stage::Structure),
            Stage::Validate => Some(Stage::Resolve),
            Stage::Publish => Some(Stage::Validate),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Structure => "structure",
            Stage::Resolve => "resolve",
            Stage::Validate => "validate",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown stage '{}'", s.trim())))
    }
}

/// An ordered subset of the stage chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSet(BTreeSet<Stage>);

impl StageSet {
    pub fn all() -> Self {
        Self(Stage::ALL.into_iter().collect())
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        self.0.iter().copied()
    }

    /// Parse a comma-separated list such as `"resolve,validate,publish"`.
    pub fn parse_list(s: &str) -> Result<Self, PipelineError> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Stage::from_str)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<Stage> for StageSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Default for StageSet {
    fn default() -> Self {
        Self::all()
    }
}

// ── Run configuration ────────────────────────────────────────────────────────

/// Preset run modes exposed by the CLI wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every stage, OCR included.
    Full,
    /// Every stage, but PDF/image documents are excluded from extraction.
    Quick,
}

/// Per-invocation control object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub stages: StageSet,
    pub allow_ocr: bool,
    pub publish_flagged: bool,
    /// Share of failed items above which the run aborts before Publish. Default: 0.5.
    pub failure_rate_abort_threshold: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::full()
    }
}

impl RunConfig {
    pub fn full() -> Self {
        Self {
            stages: StageSet::all(),
            allow_ocr: true,
            publish_flagged: true,
            failure_rate_abort_threshold: 0.5,
        }
    }

    /// All stages without OCR: only HTML-sourced candidates are used.
    pub fn quick() -> Self {
        Self {
            allow_ocr: false,
            ..Self::full()
        }
    }

    pub fn for_mode(mode: RunMode) -> Self {
        match mode {
            RunMode::Full => Self::full(),
            RunMode::Quick => Self::quick(),
        }
    }

    pub fn with_stages(mut self, stages: StageSet) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_publish_flagged(mut self, v: bool) -> Self {
        self.publish_flagged = v;
        self
    }

    pub fn with_abort_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_abort_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one stage must be selected".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_abort_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "failure-rate abort threshold must be within 0.0–1.0, got {}",
                self.failure_rate_abort_threshold
            )));
        }
        Ok(())
    }
}

// ── Pipeline configuration ───────────────────────────────────────────────────

/// Static tuning for the pipeline.
///
/// # Example
/// ```rust
/// use shuttle_routes::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .data_dir("/var/lib/shuttle-routes")
///     .fetch_concurrency(2)
///     .duplicate_distance_m(8.0)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the artifact store. Default: `./data`.
    pub data_dir: PathBuf,

    /// Concurrent fetches. Default: 4.
    ///
    /// Municipal servers are small; politeness matters more than speed.
    pub fetch_concurrency: usize,

    /// Concurrent OCR calls. Default: 2.
    pub ocr_concurrency: usize,

    /// Concurrent geocoding lookups. Default: 4.
    pub geocode_concurrency: usize,

    /// Minimum spacing between outbound geocoding calls in milliseconds. Default: 100.
    pub geocode_min_interval_ms: u64,

    /// Maximum retries on a transient network failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Per-request HTTP timeout in seconds. Default: 15.
    pub fetch_timeout_secs: u64,

    /// Wall-clock budget for the whole run. Default: none.
    ///
    /// Items still in flight when it elapses fail with `run_timeout`.
    pub run_timeout_secs: Option<u64>,

    /// OCR confidence below this tags text as low-confidence. Default: 0.4.
    pub ocr_confidence_floor: f32,

    /// Same-name stops closer than this are duplicates. Default: 5.0.
    pub duplicate_distance_m: f64,

    /// User agent sent with every fetch.
    pub user_agent: String,

    /// OCR capability. If None, the vision-LLM engine is built from the
    /// environment (feature `vlm-ocr`), else OCR items fail as unavailable.
    pub ocr_engine: Option<Arc<dyn OcrEngine>>,

    /// Geocoding capability. If None, Kakao (when `KAKAO_API_KEY` is set)
    /// chained with the offline landmark table.
    pub geocoder: Option<Arc<dyn GeocodeProvider>>,

    /// HTTP transport. If None, a reqwest client is built from this config.
    pub transport: Option<Arc<dyn HttpTransport>>,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            fetch_concurrency: 4,
            ocr_concurrency: 2,
            geocode_concurrency: 4,
            geocode_min_interval_ms: 100,
            max_retries: 3,
            retry_backoff_ms: 500,
            fetch_timeout_secs: 15,
            run_timeout_secs: None,
            ocr_confidence_floor: 0.4,
            duplicate_distance_m: 5.0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ocr_engine: None,
            geocoder: None,
            transport: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("data_dir", &self.data_dir)
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("ocr_concurrency", &self.ocr_concurrency)
            .field("geocode_concurrency", &self.geocode_concurrency)
            .field("geocode_min_interval_ms", &self.geocode_min_interval_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("run_timeout_secs", &self.run_timeout_secs)
            .field("ocr_confidence_floor", &self.ocr_confidence_floor)
            .field("duplicate_distance_m", &self.duplicate_distance_m)
            .field("ocr_engine", &self.ocr_engine.as_ref().map(|e| e.name().to_string()))
            .field("geocoder", &self.geocoder.as_ref().map(|g| g.name().to_string()))
            .field("transport", &self.transport.as_ref().map(|_| "<dyn HttpTransport>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn fetch_concurrency(mut self, n: usize) -> Self {
        self.config.fetch_concurrency = n.max(1);
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.ocr_concurrency = n.max(1);
        self
    }

    pub fn geocode_concurrency(mut self, n: usize) -> Self {
        self.config.geocode_concurrency = n.max(1);
        self
    }

    pub fn geocode_min_interval_ms(mut self, ms: u64) -> Self {
        self.config.geocode_min_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.run_timeout_secs = Some(secs);
        self
    }

    pub fn ocr_confidence_floor(mut self, floor: f32) -> Self {
        self.config.ocr_confidence_floor = floor;
        self
    }

    pub fn duplicate_distance_m(mut self, meters: f64) -> Self {
        self.config.duplicate_distance_m = meters;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.config.ocr_engine = Some(engine);
        self
    }

    pub fn geocoder(mut self, geocoder: Arc<dyn GeocodeProvider>) -> Self {
        self.config.geocoder = Some(geocoder);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.config.transport = Some(transport);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.ocr_confidence_floor) {
            return Err(PipelineError::InvalidConfig(format!(
                "OCR confidence floor must be within 0.0–1.0, got {}",
                c.ocr_confidence_floor
            )));
        }
        if c.duplicate_distance_m.is_nan() || c.duplicate_distance_m < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "duplicate distance must be ≥ 0 m, got {}",
                c.duplicate_distance_m
            )));
        }
        if c.fetch_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "fetch timeout must be ≥ 1 s".into(),
            ));
        }
        if c.run_timeout_secs == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "run timeout must be ≥ 1 s".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.retry_backoff_ms, 500);
        assert_eq!(c.fetch_timeout_secs, 15);
        assert!((c.ocr_confidence_floor - 0.4).abs() < f32::EPSILON);
        assert!((c.duplicate_distance_m - 5.0).abs() < f64::EPSILON);
        let r = RunConfig::default();
        assert!((r.failure_rate_abort_threshold - 0.5).abs() < f64::EPSILON);
        assert!(r.allow_ocr);
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = PipelineConfig::builder()
            .fetch_concurrency(0)
            .geocode_concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.fetch_concurrency, 1);
        assert_eq!(c.geocode_concurrency, 1);
    }

    #[test]
    fn builder_rejects_bad_floor() {
        let err = PipelineConfig::builder()
            .ocr_confidence_floor(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("confidence floor"));
    }

    #[test]
    fn quick_mode_disables_ocr() {
        let q = RunConfig::for_mode(RunMode::Quick);
        assert!(!q.allow_ocr);
        assert_eq!(q.stages, StageSet::all());
    }

    #[test]
    fn stage_list_parsing() {
        let set = StageSet::parse_list("publish, Resolve,validate").unwrap();
        let stages: Vec<_> = set.iter().collect();
        assert_eq!(stages, vec![Stage::Resolve, Stage::Validate, Stage::Publish]);
        assert!(StageSet::parse_list("resolve,teleport").is_err());
    }

    #[test]
    fn run_config_validation() {
        assert!(RunConfig::full().with_abort_threshold(1.2).validate().is_err());
        assert!(RunConfig::full()
            .with_stages(StageSet::from_iter([]))
            .validate()
            .is_err());
        assert!(RunConfig::quick().validate().is_ok());
    }

    #[test]
    fn predecessor_chain_is_linear() {
        for pair in Stage::ALL.windows(2) {
            assert_eq!(pair[1].predecessor(), Some(pair[0]));
        }
        assert_eq!(Stage::Discover.predecessor(), None);
    }
}
