//! The orchestrator: drives the stage chain and owns the run report.
//!
//! ```text
//! Discover ─▶ Fetch ─▶ Extract ─▶ Structure ─▶ Resolve ─▶ Validate ─▶ Publish
//!              │          │
//!              └──────────┴── failure rate > threshold ─▶ Aborted
//! ```
//!
//! Each stage reads the previous stage's artifacts from the working
//! generation, which starts as the persisted [`Manifest`] and is updated by
//! every stage that runs. A selected stage whose predecessor has no recorded
//! output stops the run with `MissingDependency`.
//!
//! Items are processed through bounded pools (`buffer_unordered`) and then
//! re-sorted by input index, so artifacts and reports are deterministic.
//! Every item that already has an artifact for its input key is skipped.
//!
//! The manifest is saved only when a run succeeds. Every run, aborted or not,
//! appends one [`RunReport`] to `reports/runs.jsonl`.

use crate::config::{PipelineConfig, RunConfig, Stage};
use crate::error::{AbortReason, ExtractionError, FetchError, PipelineError, StructuringError};
use crate::model::{
    CandidateStop, DocumentKind, ExtractedText, RawDocument, ResolvedDocument, ResolvedStop, Source,
    StructuredDocument, Verdict,
};
use crate::pipeline::extract::{Extraction, Extractor};
use crate::pipeline::fetch::{FetchOutcome, Fetcher, HttpTransport, ReqwestTransport};
use crate::pipeline::html::discover_attachments;
use crate::pipeline::kakao::KakaoGeocoder;
use crate::pipeline::landmarks::LandmarkGeocoder;
use crate::pipeline::ocr::{OcrEngine, UnavailableOcrEngine};
use crate::pipeline::publish::{publish, Publication};
use crate::pipeline::resolve::{Area, FallbackGeocoder, GeocodeCache, GeocodeProvider, Resolver};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::structure::{structure, STRUCTURER_VERSION};
use crate::pipeline::validate::{validate_documents, ValidationOutcome};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::rate_limit::RateLimiter;
use crate::report::{
    DatasetQuality, Discard, PublishOutcome, ResolveStats, RunOutcome, RunReport, StageReport, StageState,
    ValidationSummary,
};
use crate::sources::SourceCatalog;
use crate::store::{artifact_key, ArtifactKind, ArtifactStore, Manifest, Recorded};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

type ExtractRecord = Recorded<ExtractedText, ExtractionError>;
type StructureRecord = Recorded<StructuredDocument, StructuringError>;

const RUN_TIMEOUT: &str = "run_timeout";

// ── State machine ────────────────────────────────────────────────────────────

/// Where a run is in the stage chain.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// About to enter (or skip) this stage.
    Pending(Stage),
    /// Every selected stage completed.
    Finished,
    /// Stopped before publishing; nothing was written.
    Aborted { stage: Stage, reason: AbortReason },
    /// A selected stage had no upstream artifacts.
    Blocked { stage: Stage, requires: Stage },
}

impl RunState {
    pub fn start() -> Self {
        RunState::Pending(Stage::Discover)
    }

    /// The state following a completed (or deselected) stage.
    pub fn after(stage: Stage) -> Self {
        Stage::ALL
            .iter()
            .position(|s| *s == stage)
            .and_then(|i| Stage::ALL.get(i + 1))
            .map_or(RunState::Finished, |next| RunState::Pending(*next))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending(_))
    }
}

/// Whether `generation` holds the output `stage` produces.
fn has_output(generation: &Manifest, stage: Stage) -> bool {
    match stage {
        Stage::Discover => generation.sources.is_some(),
        Stage::Fetch => generation.fetched.is_some(),
        Stage::Extract => generation.extracted.is_some(),
        Stage::Structure => generation.structured.is_some(),
        Stage::Resolve => generation.resolved.is_some(),
        Stage::Validate => generation.validation.is_some(),
        Stage::Publish => true,
    }
}

// ── Keys ─────────────────────────────────────────────────────────────────────

/// OCR documents also key on the engine and the confidence floor, which
/// both shape the recorded text and its `low_confidence` tag.
fn extracted_key(doc: &RawDocument, engine: &str, confidence_floor: f32) -> String {
    let base = [
        "extract",
        doc.content_hash.as_str(),
        doc.source.authority.as_str(),
        doc.source.url.as_str(),
    ];
    if !doc.kind.needs_ocr() {
        return artifact_key(&base);
    }
    let floor = format!("{confidence_floor}");
    let mut parts = base.to_vec();
    parts.extend([engine, floor.as_str()]);
    artifact_key(&parts)
}

fn structured_key(extracted: &str, districts: &str) -> String {
    artifact_key(&["structure", STRUCTURER_VERSION, districts, extracted])
}

fn resolved_key(structured: &str, fingerprint: &str) -> String {
    artifact_key(&["resolve", structured, fingerprint])
}

fn validation_key(resolved: &[String], duplicate_distance_m: f64) -> String {
    let threshold = format!("{duplicate_distance_m}");
    let mut parts: Vec<&str> = vec!["validate", &threshold];
    parts.extend(resolved.iter().map(String::as_str));
    artifact_key(&parts)
}

/// Await `fut` unless the run deadline passes first.
async fn within<T>(deadline: Option<Instant>, fut: impl Future<Output = T>) -> Option<T> {
    match deadline {
        Some(d) => tokio::time::timeout_at(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Stop reasons that may change on the next attempt; documents containing
/// them are not cached under their canonical key.
fn is_transient_reason(reason: &str) -> bool {
    reason == RUN_TIMEOUT || reason.starts_with("provider_error")
}

// ── Run context ──────────────────────────────────────────────────────────────

struct RunContext<'a> {
    config: &'a PipelineConfig,
    run: &'a RunConfig,
    catalog: &'a SourceCatalog,
    store: ArtifactStore,
    run_id: Uuid,
    /// The manifest as loaded; consulted for conditional fetches.
    previous: Manifest,
    /// The generation being built by this run.
    generation: Manifest,
    reports: BTreeMap<Stage, StageReport>,
    discards: Vec<Discard>,
    resolve_stats: ResolveStats,
    validation: ValidationSummary,
    outcome: Option<ValidationOutcome>,
    publish: PublishOutcome,
    quality: Option<DatasetQuality>,
    deadline: Option<Instant>,
    progress: ProgressCallback,
}

impl RunContext<'_> {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            backoff_ms: self.config.retry_backoff_ms,
        }
    }

    fn discard(&mut self, stage: Stage, item: &str, reason: &str, detail: String, cached: bool) {
        debug!("{stage}: discarding {item}: {reason}");
        self.discards.push(Discard {
            stage,
            item: item.to_string(),
            reason: reason.to_string(),
            detail,
            cached,
        });
    }

    fn begin(&self, stage: Stage, items: usize) -> (StageReport, StdInstant) {
        info!("── {} ({} items) ──", stage, items);
        self.progress.on_stage_start(stage, items);
        let mut report = StageReport::new(stage);
        report.input = items;
        (report, StdInstant::now())
    }

    fn finish(&mut self, mut report: StageReport, started: StdInstant) {
        report.duration_ms = started.elapsed().as_millis() as u64;
        report.settle();
        info!(
            "{}: {} ok, {} failed, {} cached, {} excluded in {}ms",
            report.stage,
            report.succeeded,
            report.failed,
            report.cached,
            report.excluded,
            report.duration_ms
        );
        self.progress.on_stage_complete(&report);
        self.reports.insert(report.stage, report);
    }

    /// Abort when the stage's failure rate exceeds the threshold.
    fn check_failure_rate(&self, stage: Stage) -> Option<RunState> {
        let report = self.reports.get(&stage)?;
        let threshold = self.run.failure_rate_abort_threshold;
        if report.failure_rate() > threshold {
            let considered = report.input.saturating_sub(report.excluded);
            let failed = report.failed + report.cached_failed;
            warn!(
                "{}: {}/{} items failed, above the {:.0}% threshold; aborting before publish",
                stage,
                failed,
                considered,
                threshold * 100.0
            );
            return Some(RunState::Aborted {
                stage,
                reason: AbortReason::FailureRateExceeded {
                    stage,
                    failed,
                    considered,
                    threshold,
                },
            });
        }
        None
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<RunState, PipelineError> {
        match stage {
            Stage::Discover => self.discover(),
            Stage::Fetch => {
                self.fetch().await?;
                return Ok(self.check_failure_rate(stage).unwrap_or(RunState::after(stage)));
            }
            Stage::Extract => {
                self.extract().await?;
                return Ok(self.check_failure_rate(stage).unwrap_or(RunState::after(stage)));
            }
            Stage::Structure => self.structure().await?,
            Stage::Resolve => self.resolve().await?,
            Stage::Validate => self.validate().await?,
            Stage::Publish => {
                if let Some(reason) = self.publish().await? {
                    return Ok(RunState::Aborted { stage, reason });
                }
            }
        }
        Ok(RunState::after(stage))
    }

    // ── Discover ─────────────────────────────────────────────────────────

    fn discover(&mut self) {
        let sources = self.catalog.sources();
        let (mut report, started) = self.begin(Stage::Discover, sources.len());
        let unchanged = self.previous.sources.as_ref() == Some(&sources);
        for source in &sources {
            self.progress.on_item_complete(Stage::Discover, &source.url, unchanged);
        }
        if unchanged {
            report.cached = sources.len();
        } else {
            report.succeeded = sources.len();
        }
        self.generation.sources = Some(sources);
        self.finish(report, started);
    }

    // ── Fetch ────────────────────────────────────────────────────────────

    fn transport(&self) -> Result<Arc<dyn HttpTransport>, PipelineError> {
        match &self.config.transport {
            Some(t) => Ok(Arc::clone(t)),
            None => Ok(Arc::new(ReqwestTransport::new(self.config)?)),
        }
    }

    async fn fetch_wave(
        &self,
        fetcher: &Fetcher,
        wave: &[Source],
    ) -> Result<Vec<Option<Result<FetchOutcome, FetchError>>>, PipelineError> {
        let deadline = self.deadline;
        let progress = Arc::clone(&self.progress);
        let mut results: Vec<(usize, Option<Result<Result<FetchOutcome, _>, PipelineError>>)> =
            stream::iter(wave.iter().enumerate().map(|(idx, source)| {
                let fetcher = fetcher.clone();
                let previous = self.previous.fetched_for(&source.url).cloned();
                let progress = Arc::clone(&progress);
                async move {
                    let result = within(deadline, fetcher.fetch(source, previous.as_ref())).await;
                    match &result {
                        Some(Ok(Ok(outcome))) => progress.on_item_complete(
                            Stage::Fetch,
                            &source.url,
                            matches!(outcome, FetchOutcome::Unchanged(_)),
                        ),
                        Some(Ok(Err(e))) => progress.on_item_error(Stage::Fetch, &source.url, &e.to_string()),
                        None => progress.on_item_error(Stage::Fetch, &source.url, RUN_TIMEOUT),
                        Some(Err(_)) => {}
                    }
                    (idx, result)
                }
            }))
            .buffer_unordered(self.config.fetch_concurrency)
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);
        results
            .into_iter()
            .map(|(_, r)| r.transpose())
            .collect()
    }

    async fn fetch(&mut self) -> Result<(), PipelineError> {
        let sources = self.generation.sources.clone().unwrap_or_default();
        let (mut report, started) = self.begin(Stage::Fetch, sources.len());
        report.input = 0;
        let fetcher = Fetcher::new(self.transport()?, self.store.clone(), self.retry());

        let mut known: HashSet<String> = sources.iter().map(|s| s.url.clone()).collect();
        let mut documents = Vec::new();
        let mut wave = sources;
        let mut depth = 0;

        // Listing pages first, then the attachments they link to. One level.
        while !wave.is_empty() {
            let results = self.fetch_wave(&fetcher, &wave).await?;
            let mut derived = Vec::new();
            for (source, result) in wave.iter().zip(results) {
                report.input += 1;
                match result {
                    Some(Ok(outcome)) => {
                        match outcome {
                            FetchOutcome::Fresh(_) => report.succeeded += 1,
                            FetchOutcome::Unchanged(_) => report.cached += 1,
                        }
                        let doc = outcome.into_document();
                        if depth == 0 && doc.kind == DocumentKind::Html {
                            let bytes = self.store.get_document(&doc.content_hash).await?;
                            let html = String::from_utf8_lossy(&bytes);
                            for attachment in discover_attachments(source, &html) {
                                if known.insert(attachment.url.clone()) {
                                    debug!("{}: found attachment {}", source.url, attachment.url);
                                    derived.push(attachment);
                                }
                            }
                        }
                        documents.push(doc);
                    }
                    Some(Err(e)) => {
                        report.failed += 1;
                        warn!("{}: fetch failed: {}", source.url, e);
                        self.discard(Stage::Fetch, &source.url, e.code(), e.to_string(), false);
                    }
                    None => {
                        report.failed += 1;
                        self.discard(
                            Stage::Fetch,
                            &source.url,
                            RUN_TIMEOUT,
                            "run deadline elapsed".into(),
                            false,
                        );
                    }
                }
            }
            if !derived.is_empty() {
                info!("Discovered {} attachments", derived.len());
            }
            wave = derived;
            depth += 1;
        }

        self.generation.fetched = Some(documents);
        self.finish(report, started);
        Ok(())
    }

    // ── Extract ──────────────────────────────────────────────────────────

    fn ocr_engine(&self) -> Arc<dyn OcrEngine> {
        if let Some(engine) = &self.config.ocr_engine {
            return Arc::clone(engine);
        }
        default_ocr_engine(self.config)
    }

    async fn extract(&mut self) -> Result<(), PipelineError> {
        let documents = self.generation.fetched.clone().unwrap_or_default();
        let (mut report, started) = self.begin(Stage::Extract, documents.len());
        let mut keys: Vec<(usize, String)> = Vec::new();
        let mut pending: Vec<(usize, RawDocument, String)> = Vec::new();

        let engine: Arc<dyn OcrEngine> = if self.run.allow_ocr && documents.iter().any(|d| d.kind.needs_ocr()) {
            self.ocr_engine()
        } else {
            Arc::new(UnavailableOcrEngine::new("no document needed OCR"))
        };
        let floor = self.config.ocr_confidence_floor;

        for (idx, doc) in documents.into_iter().enumerate() {
            let key = extracted_key(&doc, engine.name(), floor);
            if doc.kind.needs_ocr() && !self.run.allow_ocr {
                report.excluded += 1;
                self.progress.on_item_complete(Stage::Extract, &doc.source.url, false);
                self.discard(
                    Stage::Extract,
                    &doc.source.url,
                    "ocr_disabled",
                    format!("{:?} document skipped in quick mode", doc.kind),
                    false,
                );
                continue;
            }
            match self.store.get_artifact::<ExtractRecord>(ArtifactKind::Extracted, &key).await? {
                Some(Recorded::Ok(_)) => {
                    report.cached += 1;
                    self.progress.on_item_complete(Stage::Extract, &doc.source.url, true);
                    keys.push((idx, key));
                }
                Some(Recorded::Failed(e)) => {
                    report.cached += 1;
                    report.cached_failed += 1;
                    self.progress.on_item_error(Stage::Extract, &doc.source.url, &e.to_string());
                    self.discard(Stage::Extract, &doc.source.url, e.code(), e.to_string(), true);
                }
                None => pending.push((idx, doc, key)),
            }
        }

        let extractor = Extractor::new(engine, self.store.clone(), floor);
        let allow_ocr = self.run.allow_ocr;
        let deadline = self.deadline;

        let mut results: Vec<_> = stream::iter(pending.into_iter().map(|(idx, doc, key)| {
            let extractor = extractor.clone();
            async move {
                let result = within(deadline, extractor.extract(&doc, allow_ocr)).await;
                (idx, doc, key, result)
            }
        }))
        .buffer_unordered(self.config.ocr_concurrency)
        .collect()
        .await;
        results.sort_by_key(|(idx, ..)| *idx);

        for (idx, doc, key, result) in results {
            let url = doc.source.url.as_str();
            match result.transpose()? {
                Some(Ok(Extraction::Text(text))) => {
                    self.store
                        .put_artifact(ArtifactKind::Extracted, &key, &ExtractRecord::Ok(text))
                        .await?;
                    report.succeeded += 1;
                    self.progress.on_item_complete(Stage::Extract, url, false);
                    keys.push((idx, key));
                }
                Some(Ok(Extraction::Excluded { reason })) => {
                    report.excluded += 1;
                    self.discard(Stage::Extract, url, &reason, "excluded by run policy".into(), false);
                }
                Some(Err(e)) => {
                    if e.is_deterministic() {
                        self.store
                            .put_artifact(ArtifactKind::Extracted, &key, &ExtractRecord::Failed(e.clone()))
                            .await?;
                    }
                    report.failed += 1;
                    warn!("{}: extraction failed: {}", url, e);
                    self.progress.on_item_error(Stage::Extract, url, &e.to_string());
                    self.discard(Stage::Extract, url, e.code(), e.to_string(), false);
                }
                None => {
                    report.failed += 1;
                    self.progress.on_item_error(Stage::Extract, url, RUN_TIMEOUT);
                    self.discard(Stage::Extract, url, RUN_TIMEOUT, "run deadline elapsed".into(), false);
                }
            }
        }

        keys.sort_by_key(|(idx, _)| *idx);
        self.generation.extracted = Some(keys.into_iter().map(|(_, k)| k).collect());
        self.finish(report, started);
        Ok(())
    }

    // ── Structure ────────────────────────────────────────────────────────

    async fn structure(&mut self) -> Result<(), PipelineError> {
        let extracted = self.generation.extracted.clone().unwrap_or_default();
        let (mut report, started) = self.begin(Stage::Structure, extracted.len());
        let mut keys = Vec::new();
        let districts = self.catalog.districts();
        let district_fingerprint = districts.fingerprint();

        for ekey in extracted {
            let skey = structured_key(&ekey, &district_fingerprint);
            let (record, cached) = match self
                .store
                .get_artifact::<StructureRecord>(ArtifactKind::Structured, &skey)
                .await?
            {
                Some(record) => (record, true),
                None => {
                    let text = match self.store.get_artifact::<ExtractRecord>(ArtifactKind::Extracted, &ekey).await? {
                        Some(Recorded::Ok(text)) => text,
                        _ => {
                            return Err(PipelineError::Internal(format!(
                                "extracted artifact {ekey} is recorded but missing"
                            )))
                        }
                    };
                    let record = match structure(&text, &districts) {
                        Ok(doc) => StructureRecord::Ok(doc),
                        Err(e) => {
                            warn!("{}: {}", text.source_url, e);
                            StructureRecord::Failed(e)
                        }
                    };
                    self.store.put_artifact(ArtifactKind::Structured, &skey, &record).await?;
                    (record, false)
                }
            };

            if cached {
                report.cached += 1;
            }
            match record {
                Recorded::Ok(doc) => {
                    if !cached {
                        report.succeeded += 1;
                    }
                    self.progress.on_item_complete(Stage::Structure, &doc.document_hash, cached);
                    keys.push(skey);
                }
                Recorded::Failed(e) => {
                    if cached {
                        report.cached_failed += 1;
                    } else {
                        report.failed += 1;
                    }
                    self.progress.on_item_error(Stage::Structure, &ekey, &e.to_string());
                    self.discard(Stage::Structure, &ekey, e.code(), e.to_string(), cached);
                }
            }
        }

        self.generation.structured = Some(keys);
        self.finish(report, started);
        Ok(())
    }

    // ── Resolve ──────────────────────────────────────────────────────────

    fn geocoder(&self) -> Arc<dyn GeocodeProvider> {
        if let Some(g) = &self.config.geocoder {
            return Arc::clone(g);
        }
        default_geocoder(self.config)
    }

    fn area_for(&self, authority: &str) -> Area {
        match self.catalog.area_for(authority) {
            Some(area) => area,
            None => {
                warn!("{authority}: not in the source catalog; resolving without area bias");
                Area {
                    id: authority.to_string(),
                    name: String::new(),
                    center: None,
                }
            }
        }
    }

    async fn resolve(&mut self) -> Result<(), PipelineError> {
        let structured = self.generation.structured.clone().unwrap_or_default();
        let (mut report, started) = self.begin(Stage::Resolve, structured.len());

        let cache = GeocodeCache::load(self.store.geocode_cache_path()).await?;
        let resolver = Resolver::new(
            self.geocoder(),
            Arc::new(cache),
            RateLimiter::new(self.config.geocode_min_interval_ms),
            self.retry(),
            self.config.geocode_concurrency,
        )
        .with_overrides(self.catalog.overrides())
        .with_deadline(self.deadline);
        let fingerprint = resolver.fingerprint();

        let mut keys: Vec<Option<String>> = vec![None; structured.len()];
        let mut pending: Vec<(usize, String, StructuredDocument)> = Vec::new();
        for (idx, skey) in structured.iter().enumerate() {
            let rkey = resolved_key(skey, &fingerprint);
            if self
                .store
                .get_artifact::<ResolvedDocument>(ArtifactKind::Resolved, &rkey)
                .await?
                .is_some()
            {
                report.cached += 1;
                self.progress.on_item_complete(Stage::Resolve, skey, true);
                keys[idx] = Some(rkey);
                continue;
            }
            match self.store.get_artifact::<StructureRecord>(ArtifactKind::Structured, skey).await? {
                Some(Recorded::Ok(doc)) => pending.push((idx, rkey, doc)),
                _ => {
                    return Err(PipelineError::Internal(format!(
                        "structured artifact {skey} is recorded but missing"
                    )))
                }
            }
        }

        if !pending.is_empty() {
            // One batch per (document, candidate authority); district
            // sections of a notice resolve against their own area.
            let mut areas: BTreeMap<String, Area> = BTreeMap::new();
            let mut groups: Vec<(usize, Vec<usize>, Vec<CandidateStop>, String)> = Vec::new();
            for (p, (_, _, doc)) in pending.iter().enumerate() {
                let mut by_authority: BTreeMap<&str, (Vec<usize>, Vec<CandidateStop>)> = BTreeMap::new();
                for (i, c) in doc.candidates.iter().enumerate() {
                    let entry = by_authority.entry(c.authority.as_str()).or_default();
                    entry.0.push(i);
                    entry.1.push(c.clone());
                }
                for (authority, (positions, candidates)) in by_authority {
                    if !areas.contains_key(authority) {
                        areas.insert(authority.to_string(), self.area_for(authority));
                    }
                    groups.push((p, positions, candidates, authority.to_string()));
                }
            }
            let (resolved, stats) = {
                let batches: Vec<_> = groups
                    .iter()
                    .map(|(_, _, candidates, authority)| (candidates.as_slice(), &areas[authority]))
                    .collect();
                resolver.resolve_many(&batches).await?
            };
            self.resolve_stats = stats;

            let mut per_doc: Vec<Vec<Option<ResolvedStop>>> =
                pending.iter().map(|(_, _, d)| vec![None; d.candidates.len()]).collect();
            for ((p, positions, ..), stops) in groups.into_iter().zip(resolved) {
                for (i, stop) in positions.into_iter().zip(stops) {
                    per_doc[p][i] = Some(stop);
                }
            }

            for ((idx, rkey, doc), stops) in pending.into_iter().zip(per_doc) {
                let stops: Vec<ResolvedStop> = stops.into_iter().flatten().collect();
                let transient = stops
                    .iter()
                    .filter_map(|s| s.unresolved_reason.as_deref())
                    .any(is_transient_reason);
                // Partial results are kept for this generation only.
                let key = if transient {
                    artifact_key(&[&rkey, "partial", &self.run_id.to_string()])
                } else {
                    rkey
                };
                let resolved = ResolvedDocument {
                    authority: doc.authority,
                    document_hash: doc.document_hash,
                    stops,
                    notes: doc.notes,
                };
                self.store.put_artifact(ArtifactKind::Resolved, &key, &resolved).await?;
                report.succeeded += 1;
                self.progress.on_item_complete(Stage::Resolve, &resolved.document_hash, false);
                keys[idx] = Some(key);
            }
        }

        info!(
            "Resolve: {} stops, {} resolved, {} unresolved, {} manual, {} cache hits, {} provider lookups",
            self.resolve_stats.stops,
            self.resolve_stats.resolved,
            self.resolve_stats.unresolved,
            self.resolve_stats.manual,
            self.resolve_stats.cache_hits,
            self.resolve_stats.provider_calls
        );
        self.generation.resolved = Some(keys.into_iter().flatten().collect());
        self.finish(report, started);
        Ok(())
    }

    // ── Validate ─────────────────────────────────────────────────────────

    async fn validate(&mut self) -> Result<(), PipelineError> {
        let resolved = self.generation.resolved.clone().unwrap_or_default();
        let (mut report, started) = self.begin(Stage::Validate, 1);
        let vkey = validation_key(&resolved, self.config.duplicate_distance_m);

        let cached = self
            .store
            .get_artifact::<ValidationOutcome>(ArtifactKind::Validation, &vkey)
            .await?;
        let (outcome, was_cached) = match cached {
            Some(outcome) => (outcome, true),
            None => {
                let mut documents = Vec::with_capacity(resolved.len());
                for rkey in &resolved {
                    let doc = self
                        .store
                        .get_artifact::<ResolvedDocument>(ArtifactKind::Resolved, rkey)
                        .await?
                        .ok_or_else(|| {
                            PipelineError::Internal(format!("resolved artifact {rkey} is recorded but missing"))
                        })?;
                    documents.push(doc);
                }
                let outcome = validate_documents(&documents, self.config.duplicate_distance_m);
                self.store.put_artifact(ArtifactKind::Validation, &vkey, &outcome).await?;
                (outcome, false)
            }
        };

        if was_cached {
            report.cached = 1;
        } else {
            report.succeeded = 1;
        }
        self.progress.on_item_complete(Stage::Validate, &vkey, was_cached);
        self.record_validation(&outcome, was_cached);
        self.generation.validation = Some(vkey);
        self.outcome = Some(outcome);
        self.finish(report, started);
        Ok(())
    }

    fn record_validation(&mut self, outcome: &ValidationOutcome, cached: bool) {
        for d in &outcome.discards {
            self.discards.push(Discard { cached, ..d.clone() });
        }
        for r in outcome.rejected() {
            self.discard(
                Stage::Validate,
                &r.route.label(),
                "rejected",
                r.verdict.reasons().join(", "),
                cached,
            );
        }
        for r in outcome.routes.iter().filter(|r| matches!(r.verdict, Verdict::Flagged(_))) {
            debug!("{}: flagged ({})", r.route.label(), r.verdict.reasons().join(", "));
        }
        self.validation = outcome.summary();
    }

    // ── Publish ──────────────────────────────────────────────────────────

    async fn publish(&mut self) -> Result<Option<AbortReason>, PipelineError> {
        let (mut report, started) = self.begin(Stage::Publish, 1);

        let outcome = match self.outcome.take() {
            Some(o) => o,
            None => {
                let vkey = self.generation.validation.clone().unwrap_or_default();
                let outcome = self
                    .store
                    .get_artifact::<ValidationOutcome>(ArtifactKind::Validation, &vkey)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Internal(format!("validation artifact {vkey} is recorded but missing"))
                    })?;
                self.validation = outcome.summary();
                outcome
            }
        };

        let Publication {
            outcome: result,
            discards,
            quality,
        } = publish(&self.store, &outcome, self.run.publish_flagged).await?;
        self.discards.extend(discards);
        self.quality = quality;
        let abort = match &result {
            PublishOutcome::Published { .. } => {
                report.succeeded = 1;
                None
            }
            PublishOutcome::Unchanged { .. } => {
                report.cached = 1;
                None
            }
            PublishOutcome::Aborted { reason } => {
                report.failed = 1;
                Some(reason.clone())
            }
            PublishOutcome::NotRequested => None,
        };
        self.publish = result;
        self.outcome = Some(outcome);
        self.finish(report, started);
        Ok(abort)
    }
}

// ── Default capabilities ─────────────────────────────────────────────────────

/// The OCR engine used when none is configured.
#[cfg(feature = "vlm-ocr")]
pub fn default_ocr_engine(config: &PipelineConfig) -> Arc<dyn OcrEngine> {
    use crate::pipeline::vision::VisionOcrEngine;
    match VisionOcrEngine::from_env(None, None, config.max_retries, config.retry_backoff_ms) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            warn!("OCR unavailable: {}", e);
            Arc::new(UnavailableOcrEngine::new(e.to_string()))
        }
    }
}

/// The OCR engine used when none is configured.
#[cfg(not(feature = "vlm-ocr"))]
pub fn default_ocr_engine(_config: &PipelineConfig) -> Arc<dyn OcrEngine> {
    Arc::new(UnavailableOcrEngine::new("built without the `vlm-ocr` feature"))
}

/// Kakao (when `KAKAO_API_KEY` is set) backed by the landmark table.
pub fn default_geocoder(config: &PipelineConfig) -> Arc<dyn GeocodeProvider> {
    let mut providers: Vec<Arc<dyn GeocodeProvider>> = Vec::new();
    match KakaoGeocoder::from_env(config.fetch_timeout_secs) {
        Some(kakao) => providers.push(Arc::new(kakao)),
        None => info!("KAKAO_API_KEY not set; geocoding with the offline landmark table only"),
    }
    providers.push(Arc::new(LandmarkGeocoder::new()));
    Arc::new(FallbackGeocoder::new(providers))
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Run the selected stages over a source catalog.
///
/// Returns the [`RunReport`] that was appended to the run log. Aborted runs
/// and missing dependencies are reported through [`RunReport::outcome`];
/// `Err` is reserved for store failures and invalid configuration. Use
/// [`RunReport::into_result`] to treat every non-success as an error.
///
/// # Example
/// ```rust,no_run
/// use shuttle_routes::{run, PipelineConfig, RunConfig, SourceCatalog};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let catalog = SourceCatalog::load("catalog.toml").await?;
/// let config = PipelineConfig::builder().data_dir("data").build()?;
/// let report = run(&catalog, &config, &RunConfig::quick()).await?.into_result()?;
/// println!("{:?}", report.publish);
/// # Ok(())
/// # }
/// ```
pub async fn run(
    catalog: &SourceCatalog,
    config: &PipelineConfig,
    run_config: &RunConfig,
) -> Result<RunReport, PipelineError> {
    run_config.validate()?;
    catalog.validate().map_err(|detail| PipelineError::SourceCatalog {
        path: "<memory>".into(),
        detail,
    })?;

    let started_at = Utc::now();
    let started = StdInstant::now();
    let store = ArtifactStore::open(&config.data_dir).await?;
    let previous = store.load_manifest().await?;
    let progress: ProgressCallback = config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback));

    let selected: Vec<Stage> = run_config.stages.iter().collect();
    info!(
        "Run started: stages [{}], OCR {}, generation {}",
        selected.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
        if run_config.allow_ocr { "on" } else { "off" },
        previous.generation
    );
    progress.on_run_start(&selected);

    let mut ctx = RunContext {
        config,
        run: run_config,
        catalog,
        store: store.clone(),
        run_id: Uuid::new_v4(),
        generation: previous.clone(),
        previous,
        reports: BTreeMap::new(),
        discards: Vec::new(),
        resolve_stats: ResolveStats::default(),
        validation: ValidationSummary::default(),
        outcome: None,
        publish: PublishOutcome::NotRequested,
        quality: None,
        deadline: config
            .run_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs)),
        progress: Arc::clone(&progress),
    };

    let mut state = RunState::start();
    while let RunState::Pending(stage) = state {
        state = if !run_config.stages.contains(stage) {
            RunState::after(stage)
        } else if let Some(requires) = stage.predecessor().filter(|p| !has_output(&ctx.generation, *p)) {
            warn!("{stage}: no recorded '{requires}' artifacts");
            RunState::Blocked { stage, requires }
        } else {
            ctx.run_stage(stage).await?
        };
    }

    let outcome = match &state {
        RunState::Aborted { stage, reason } => {
            if let Some(r) = ctx.reports.get_mut(stage) {
                r.state = StageState::Aborted;
            }
            if ctx.publish == PublishOutcome::NotRequested {
                ctx.publish = PublishOutcome::Aborted { reason: reason.clone() };
            }
            RunOutcome::Aborted { reason: reason.clone() }
        }
        RunState::Blocked { stage, requires } => RunOutcome::MissingDependency {
            stage: *stage,
            requires: *requires,
        },
        _ => RunOutcome::Succeeded,
    };

    if outcome == RunOutcome::Succeeded {
        let mut next = ctx.generation.clone();
        next.generation = ctx.previous.generation;
        next.updated_at = ctx.previous.updated_at;
        if next != ctx.previous {
            next.generation += 1;
            next.updated_at = Some(Utc::now());
            store.save_manifest(&next).await?;
            debug!("Manifest advanced to generation {}", next.generation);
        }
    }

    let dataset_hash = match &ctx.publish {
        PublishOutcome::Published { hash, .. } | PublishOutcome::Unchanged { hash, .. } => Some(hash.clone()),
        _ => store.published_hash().await?,
    };

    let stages = Stage::ALL
        .iter()
        .map(|s| ctx.reports.remove(s).unwrap_or_else(|| StageReport::new(*s)))
        .collect();

    let report = RunReport {
        run_id: ctx.run_id,
        started_at,
        finished_at: Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
        run_config: run_config.clone(),
        stages,
        discards: ctx.discards,
        resolve_stats: ctx.resolve_stats,
        validation: ctx.validation,
        publish: ctx.publish,
        quality: ctx.quality,
        dataset_hash,
        outcome,
    };

    store.append_report(&report).await?;
    progress.on_run_complete(&report);
    match &report.outcome {
        RunOutcome::Succeeded => info!("Run {} finished in {}ms", report.run_id, report.duration_ms),
        other => warn!("Run {} stopped: {:?}", report.run_id, other),
    }
    Ok(report)
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(
    catalog: &SourceCatalog,
    config: &PipelineConfig,
    run_config: &RunConfig,
) -> Result<RunReport, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(run(catalog, config, run_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_follow_the_chain() {
        assert_eq!(RunState::start(), RunState::Pending(Stage::Discover));
        assert_eq!(RunState::after(Stage::Resolve), RunState::Pending(Stage::Validate));
        assert_eq!(RunState::after(Stage::Publish), RunState::Finished);
        assert!(RunState::Finished.is_terminal());
        assert!(!RunState::start().is_terminal());
    }

    #[test]
    fn empty_manifest_has_no_outputs() {
        let m = Manifest::default();
        for stage in Stage::ALL.iter().filter(|s| **s != Stage::Publish) {
            assert!(!has_output(&m, *stage), "{stage}");
        }
    }

    #[test]
    fn validation_key_depends_on_order_and_threshold() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "x".to_string()];
        assert_ne!(validation_key(&a, 5.0), validation_key(&b, 5.0));
        assert_ne!(validation_key(&a, 5.0), validation_key(&a, 8.0));
        assert_eq!(validation_key(&a, 5.0), validation_key(&a, 5.0));
    }

    fn raw(kind: DocumentKind) -> RawDocument {
        let url = "https://www.yongsan.go.kr/files/shuttle";
        RawDocument {
            source: Source::new("yongsan", url).with_kind(kind),
            content_hash: "abc".into(),
            fetched_at: Utc::now(),
            status: 200,
            content_type: None,
            byte_len: 3,
            kind,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn extract_key_tracks_ocr_engine_and_floor() {
        let pdf = raw(DocumentKind::Pdf);
        let base = extracted_key(&pdf, "vision:gpt-4.1", 0.6);
        assert_eq!(base, extracted_key(&pdf, "vision:gpt-4.1", 0.6));
        assert_ne!(base, extracted_key(&pdf, "vision:gpt-4.1", 0.7));
        assert_ne!(base, extracted_key(&pdf, "tesseract", 0.6));

        // HTML never reaches an engine.
        let html = raw(DocumentKind::Html);
        assert_eq!(extracted_key(&html, "a", 0.6), extracted_key(&html, "b", 0.9));
    }

    #[test]
    fn transient_reasons() {
        assert!(is_transient_reason("run_timeout"));
        assert!(is_transient_reason("provider_error: timeout"));
        assert!(!is_transient_reason("no_match"));
    }

    #[tokio::test]
    async fn deadline_in_the_past_times_out() {
        let past = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let r = within(Some(past), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            1
        })
        .await;
        assert_eq!(r, None);
        assert_eq!(within(None, async { 2 }).await, Some(2));
    }
}
