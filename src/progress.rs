//! Progress-callback trait for per-stage and per-item pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator moves through the stage chain.
//!
//! # Example
//!
//! ```rust
//! use shuttle_routes::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FailureCounter {
//!     failures: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for FailureCounter {
//!     fn on_item_error(&self, stage: Stage, item: &str, error: &str) {
//!         self.failures.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage}: {item} failed: {error}");
//!     }
//! }
//!
//! let counter = Arc::new(FailureCounter { failures: AtomicUsize::new(0) });
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::config::Stage;
use crate::report::{RunReport, StageReport};
use std::sync::Arc;

/// Called by the orchestrator as it processes each stage.
///
/// Items within a stage run concurrently, so `on_item_complete` and
/// `on_item_error` may be called from several tasks at once. All methods have
/// default no-op implementations.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the first stage.
    fn on_run_start(&self, stages: &[Stage]) {
        let _ = stages;
    }

    /// Called when a stage starts.
    ///
    /// # Arguments
    /// * `stage`       : the stage being entered
    /// * `total_items` : items the stage will process
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let _ = (stage, total_items);
    }

    /// Called when one item finished, freshly or from cache.
    fn on_item_complete(&self, stage: Stage, item: &str, cached: bool) {
        let _ = (stage, item, cached);
    }

    /// Called when one item failed; the run continues.
    fn on_item_error(&self, stage: Stage, item: &str, error: &str) {
        let _ = (stage, item, error);
    }

    /// Called when a stage's counts are final.
    fn on_stage_complete(&self, report: &StageReport) {
        let _ = report;
    }

    /// Called once with the report that is about to be appended to the log.
    fn on_run_complete(&self, report: &RunReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        items: AtomicUsize,
        cached: AtomicUsize,
        errors: AtomicUsize,
        stages: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_item_complete(&self, _stage: Stage, _item: &str, cached: bool) {
            self.items.fetch_add(1, Ordering::SeqCst);
            if cached {
                self.cached.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_item_error(&self, _stage: Stage, _item: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_complete(&self, _report: &StageReport) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(&Stage::ALL);
        cb.on_stage_start(Stage::Fetch, 3);
        cb.on_item_complete(Stage::Fetch, "https://example.kr", false);
        cb.on_item_error(Stage::Extract, "abc", "unreadable");
        cb.on_stage_complete(&StageReport::new(Stage::Fetch));
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            items: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            stages: AtomicUsize::new(0),
        };
        tracker.on_item_complete(Stage::Fetch, "a", false);
        tracker.on_item_complete(Stage::Fetch, "b", true);
        tracker.on_item_error(Stage::Fetch, "c", "HTTP 404");
        tracker.on_stage_complete(&StageReport::new(Stage::Fetch));

        assert_eq!(tracker.items.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.cached.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.stages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Resolve, 10);
    }
}
