//! The per-run record appended to `reports/runs.jsonl`.
//!
//! One [`RunReport`] is written for every invocation, whether it published,
//! left the dataset unchanged, or aborted. Operators read it to monitor
//! pipeline health; no other component consumes it.

use crate::config::{RunConfig, Stage};
use crate::error::{AbortReason, PipelineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a stage ended in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// The stage did work on at least one item.
    Completed,
    /// Every item was served from cache.
    Skipped,
    /// Not selected for this run.
    NotRun,
    /// The run stopped before or during this stage.
    Aborted,
}

/// Counts for one stage.
///
/// `input = succeeded + failed + cached + excluded`; `cached_failed` counts
/// the cached items whose recorded outcome was a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub state: StageState,
    pub input: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cached: usize,
    #[serde(default)]
    pub cached_failed: usize,
    #[serde(default)]
    pub excluded: usize,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: StageState::NotRun,
            input: 0,
            succeeded: 0,
            failed: 0,
            cached: 0,
            cached_failed: 0,
            excluded: 0,
            duration_ms: 0,
        }
    }

    /// Failures (fresh or cached) over the items that were actually attempted.
    pub fn failure_rate(&self) -> f64 {
        let considered = self.input.saturating_sub(self.excluded);
        if considered == 0 {
            0.0
        } else {
            (self.failed + self.cached_failed) as f64 / considered as f64
        }
    }

    /// Set `state` from the counts once the stage is done.
    pub fn settle(&mut self) {
        self.state = if self.input > 0 && self.cached == self.input {
            StageState::Skipped
        } else {
            StageState::Completed
        };
    }
}

/// An item left out of downstream artifacts, with its reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discard {
    pub stage: Stage,
    /// URL, document hash, stop name or route label.
    pub item: String,
    /// Machine-readable reason code.
    pub reason: String,
    pub detail: String,
    /// True when the outcome was served from cache.
    #[serde(default)]
    pub cached: bool,
}

/// Geocoding statistics for the Resolve stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveStats {
    pub stops: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub manual: usize,
    pub cache_hits: usize,
    pub provider_calls: usize,
}

/// Validator partition sizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub routes: usize,
    pub accepted: usize,
    pub flagged: usize,
    pub rejected: usize,
}

/// Coverage and completeness of a published dataset.
///
/// Percentages are out of 100 and rounded to one decimal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetQuality {
    pub districts: usize,
    pub routes: usize,
    pub stops: usize,
    /// Share of the 25 Seoul districts with at least one route.
    pub district_coverage: f64,
    /// Share of route fields (hours, interval) that are filled in.
    pub info_completeness: f64,
    pub avg_stops_per_route: f64,
    /// Mean of coverage and completeness.
    pub overall_score: f64,
}

/// What happened at the Publish decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// A new dataset was written.
    Published { hash: String, routes: usize },
    /// The assembled dataset equals the current one; nothing was written.
    Unchanged { hash: String, routes: usize },
    /// Publish was not reached or was refused.
    Aborted { reason: AbortReason },
    /// Publish was not among the selected stages.
    NotRequested,
}

/// Final outcome of the run as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Aborted { reason: AbortReason },
    MissingDependency { stage: Stage, requires: Stage },
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub run_config: RunConfig,
    pub stages: Vec<StageReport>,
    pub discards: Vec<Discard>,
    #[serde(default)]
    pub resolve_stats: ResolveStats,
    #[serde(default)]
    pub validation: ValidationSummary,
    pub publish: PublishOutcome,
    /// Set whenever a non-empty dataset was assembled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<DatasetQuality>,
    /// Hash of the published dataset after this run (new or unchanged).
    pub dataset_hash: Option<String>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Discards recorded for one stage.
    pub fn discards_for(&self, stage: Stage) -> impl Iterator<Item = &Discard> {
        self.discards.iter().filter(move |d| d.stage == stage)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded)
    }

    /// Convert an aborted or blocked run into an error.
    ///
    /// `Ok(self)` for successful runs, so callers that want any abort to be
    /// an error can simply use `?`.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        match &self.outcome {
            RunOutcome::Succeeded => Ok(self),
            RunOutcome::Aborted { reason } => Err(PipelineError::PublishAborted {
                reason: reason.clone(),
            }),
            RunOutcome::MissingDependency { stage, requires } => {
                Err(PipelineError::MissingDependency {
                    stage: *stage,
                    requires: *requires,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 0,
            run_config: RunConfig::full(),
            stages: vec![],
            discards: vec![],
            resolve_stats: ResolveStats::default(),
            validation: ValidationSummary::default(),
            publish: PublishOutcome::NotRequested,
            quality: None,
            dataset_hash: None,
            outcome,
        }
    }

    #[test]
    fn failure_rate_ignores_excluded_items() {
        let mut s = StageReport::new(Stage::Extract);
        s.input = 4;
        s.excluded = 2;
        s.failed = 1;
        s.succeeded = 1;
        assert!((s.failure_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_rate_counts_cached_failures() {
        let mut s = StageReport::new(Stage::Extract);
        s.input = 3;
        s.cached = 3;
        s.cached_failed = 2;
        assert!(s.failure_rate() > 0.5);
    }

    #[test]
    fn settle_marks_fully_cached_stage_as_skipped() {
        let mut s = StageReport::new(Stage::Fetch);
        s.input = 2;
        s.cached = 2;
        s.settle();
        assert_eq!(s.state, StageState::Skipped);
        s.cached = 1;
        s.succeeded = 1;
        s.settle();
        assert_eq!(s.state, StageState::Completed);
    }

    #[test]
    fn into_result_maps_outcomes() {
        assert!(report(RunOutcome::Succeeded).into_result().is_ok());
        let err = report(RunOutcome::Aborted {
            reason: AbortReason::NothingToPublish,
        })
        .into_result()
        .unwrap_err();
        assert!(matches!(err, PipelineError::PublishAborted { .. }));
        let err = report(RunOutcome::MissingDependency {
            stage: Stage::Publish,
            requires: Stage::Validate,
        })
        .into_result()
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingDependency { .. }));
    }

    #[test]
    fn report_is_a_single_json_line() {
        let json = serde_json::to_string(&report(RunOutcome::Succeeded)).unwrap();
        assert!(!json.contains('\n'));
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert!(back.is_success());
    }
}
