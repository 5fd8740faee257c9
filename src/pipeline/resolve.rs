//! Resolve: map candidate stops to coordinates.
//!
//! ## Lookup order
//!
//! 1. Manual overrides from the source catalog (`manual`, confidence 1.0).
//! 2. The persistent [`GeocodeCache`], keyed by `area_id|normalized_name`.
//! 3. The configured [`GeocodeProvider`], rate-limited, bounded by
//!    `geocode_concurrency` and retried on transient failures.
//!
//! Candidates that normalise to the same key are looked up once per run, so
//! `"시청역"` and `" 시청 역 "` cost a single provider call.
//!
//! ## Caching rule
//!
//! Only confirmed outcomes are cached: a match that survived
//! disambiguation, or a definitive "no match". Provider failures leave the
//! stop unresolved for this run and are retried next time.
//!
//! A match is stored under the stop's [`cache_key`] and reused by any
//! provider chain. A miss is stored under [`miss_key`], which names the
//! chain that missed, so configuring a stronger provider asks again.
//!
//! ## Disambiguation
//!
//! Matches outside the service bounding box are discarded. A match whose
//! address reads `서울 <area>` (or `서울특별시 <area>`) is in-area: `exact` (0.95)
//! when its name matches the query, `fuzzy` (0.75) otherwise. Failing that,
//! the provider's best remaining match is `fuzzy` (0.45). An out-of-area
//! match is never `exact`.

use crate::error::{FetchError, PipelineError};
use crate::model::{in_bounds, CandidateStop, ResolutionMethod, ResolvedStop};
use crate::pipeline::retry::{with_backoff, RetryPolicy};
use crate::rate_limit::RateLimiter;
use crate::report::ResolveStats;
use crate::store::{append_line, artifact_key};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const EXACT_IN_AREA_CONFIDENCE: f32 = 0.95;
pub const FUZZY_IN_AREA_CONFIDENCE: f32 = 0.75;
pub const OUT_OF_AREA_CONFIDENCE: f32 = 0.45;
pub const MANUAL_CONFIDENCE: f32 = 1.0;

// ── Provider seam ────────────────────────────────────────────────────────────

/// The authority a stop belongs to, as the resolver sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    pub id: String,
    /// Administrative area name, e.g. `용산구`.
    pub name: String,
    /// Search bias centre `(lat, lon)`.
    pub center: Option<(f64, f64)>,
}

/// One geocoding request.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeQuery {
    pub name: String,
    pub address_hint: Option<String>,
    pub area_name: String,
    pub center: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// The provider's place name equals the query.
    Exact,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeMatch {
    pub lat: f64,
    pub lon: f64,
    pub name: String,
    pub address: String,
    pub match_type: MatchType,
}

/// Geocoding capability.
///
/// `Ok(vec![])` is a definitive "no match" and is cached; `Err` is a failure
/// to ask and is not.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, FetchError>;
}

/// Chains providers; the first non-empty answer wins.
///
/// An error from one provider does not stop the chain, but if every provider
/// came back empty and at least one failed, the failure is returned so the
/// outcome is not cached as a definitive miss.
pub struct FallbackGeocoder {
    providers: Vec<Arc<dyn GeocodeProvider>>,
    name: String,
}

impl FallbackGeocoder {
    pub fn new(providers: Vec<Arc<dyn GeocodeProvider>>) -> Self {
        let name = providers
            .iter()
            .map(|p| p.name().to_string())
            .collect::<Vec<_>>()
            .join("+");
        Self { providers, name }
    }
}

#[async_trait]
impl GeocodeProvider for FallbackGeocoder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, FetchError> {
        let mut failure = None;
        for provider in &self.providers {
            match provider.lookup(query).await {
                Ok(matches) if !matches.is_empty() => return Ok(matches),
                Ok(_) => {}
                Err(e) => {
                    warn!("{}: {} failed: {}", query.name, provider.name(), e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

// ── Keys ─────────────────────────────────────────────────────────────────────

static RE_DISTRICT_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[가-힣]{1,3}구$").unwrap());

const CITY_PREFIXES: &[&str] = &["서울특별시", "서울시", "서울"];

/// Normalise a stop name for caching and duplicate detection.
///
/// Lowercases, removes all whitespace and drops leading administrative
/// tokens (`서울특별시`, `서울시`, `서울`, a `…구` district) when something
/// follows them. `서울특별시` is also stripped when glued to the name.
pub fn normalize_key(name: &str) -> String {
    let mut tokens: Vec<&str> = name.split_whitespace().collect();
    while tokens.len() > 1
        && (CITY_PREFIXES.contains(&tokens[0]) || RE_DISTRICT_TOKEN.is_match(tokens[0]))
    {
        tokens.remove(0);
    }
    let joined: String = tokens.concat().to_lowercase();
    match joined.strip_prefix("서울특별시") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => joined,
    }
}

/// Cache key for a stop within an area.
pub fn cache_key(area_id: &str, name: &str) -> String {
    format!("{}|{}", area_id, normalize_key(name))
}

/// Cache key for a definitive miss by one provider chain.
pub fn miss_key(key: &str, provider: &str) -> String {
    format!("{key}#{provider}")
}

// ── Cache ────────────────────────────────────────────────────────────────────

/// A confirmed resolution outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CachedResolution {
    Found {
        lat: f64,
        lon: f64,
        method: ResolutionMethod,
        confidence: f32,
        provider: String,
        matched_name: String,
    },
    NotFound {
        provider: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    key: String,
    #[serde(flatten)]
    resolution: CachedResolution,
    cached_at: DateTime<Utc>,
}

/// Append-only JSON-lines geocode cache. The first value for a key wins.
#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, CachedResolution>>,
}

impl GeocodeCache {
    /// Load the cache file; a missing file is an empty cache and malformed
    /// lines are skipped with a warning.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let mut entries = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                for (idx, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CacheLine>(line) {
                        Ok(entry) => {
                            entries.entry(entry.key).or_insert(entry.resolution);
                        }
                        Err(e) => warn!("{}:{}: skipping cache line: {}", path.display(), idx + 1, e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::store(path, e)),
        }
        debug!("Geocode cache: {} entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<CachedResolution> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record an outcome unless the key is already present. Returns whether
    /// a line was appended.
    pub async fn insert(&self, key: &str, resolution: CachedResolution) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        let line = CacheLine {
            key: key.to_string(),
            resolution: resolution.clone(),
            cached_at: Utc::now(),
        };
        let mut bytes = serde_json::to_vec(&line).map_err(|e| PipelineError::Serialization {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        bytes.push(b'\n');
        append_line(&self.path, &bytes).await?;
        entries.insert(key.to_string(), resolution);
        Ok(true)
    }
}

// ── Disambiguation ───────────────────────────────────────────────────────────

fn names_match(query: &str, candidate: &str) -> bool {
    normalize_key(query) == normalize_key(candidate)
}

/// Whether `address` lies in the Seoul area `area_name`.
///
/// The district must directly follow a Seoul city token: `부산 중구` is not
/// `중구`. A city-level area accepts any Seoul address.
pub fn address_in_area(address: &str, area_name: &str) -> bool {
    if area_name.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = address.split_whitespace().collect();
    if CITY_PREFIXES.contains(&area_name) {
        return tokens.first().is_some_and(|t| CITY_PREFIXES.contains(t));
    }
    tokens
        .windows(2)
        .any(|w| CITY_PREFIXES.contains(&w[0]) && w[1] == area_name)
}

/// Pick a match and grade it.
pub fn disambiguate(
    query: &GeocodeQuery,
    matches: &[GeocodeMatch],
) -> Option<(GeocodeMatch, ResolutionMethod, f32)> {
    let in_box: Vec<&GeocodeMatch> = matches
        .iter()
        .filter(|m| {
            let ok = in_bounds(m.lat, m.lon);
            if !ok {
                warn!(
                    "{}: discarding match '{}' at ({}, {}) outside the service area",
                    query.name, m.name, m.lat, m.lon
                );
            }
            ok
        })
        .collect();

    let in_area = |m: &GeocodeMatch| address_in_area(&m.address, &query.area_name);
    let exact = |m: &GeocodeMatch| m.match_type == MatchType::Exact || names_match(&query.name, &m.name);

    if let Some(m) = in_box.iter().copied().find(|m| in_area(*m) && exact(*m)) {
        return Some((m.clone(), ResolutionMethod::Exact, EXACT_IN_AREA_CONFIDENCE));
    }
    if let Some(m) = in_box.iter().copied().find(|m| in_area(*m)) {
        return Some((m.clone(), ResolutionMethod::Fuzzy, FUZZY_IN_AREA_CONFIDENCE));
    }
    in_box
        .first()
        .map(|m| ((*m).clone(), ResolutionMethod::Fuzzy, OUT_OF_AREA_CONFIDENCE))
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Outcome for one unique key within a run.
#[derive(Debug, Clone)]
enum KeyOutcome {
    Confirmed(CachedResolution),
    Failed(String),
}

/// Batch resolver shared by every document of a run.
pub struct Resolver {
    provider: Arc<dyn GeocodeProvider>,
    cache: Arc<GeocodeCache>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    concurrency: usize,
    overrides: HashMap<String, (f64, f64)>,
    deadline: Option<Instant>,
}

impl Resolver {
    pub fn new(
        provider: Arc<dyn GeocodeProvider>,
        cache: Arc<GeocodeCache>,
        limiter: RateLimiter,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            limiter,
            retry,
            concurrency: concurrency.max(1),
            overrides: HashMap::new(),
            deadline: None,
        }
    }

    /// Manual coordinates as `(authority, stop, lat, lon)`.
    pub fn with_overrides<'a>(mut self, overrides: impl IntoIterator<Item = (&'a str, &'a str, f64, f64)>) -> Self {
        for (authority, stop, lat, lon) in overrides {
            self.overrides
                .entry(cache_key(authority, stop))
                .or_insert((lat, lon));
        }
        self
    }

    /// Lookups still pending at `deadline` leave their stops unresolved.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Identifies everything besides the candidates that affects output:
    /// the provider chain and the manual overrides.
    pub fn fingerprint(&self) -> String {
        let overrides: BTreeMap<&String, String> = self
            .overrides
            .iter()
            .map(|(k, (lat, lon))| (k, format!("{lat:.6},{lon:.6}")))
            .collect();
        let mut parts = vec![self.provider.name().to_string()];
        parts.extend(overrides.into_iter().map(|(k, v)| format!("{k}={v}")));
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        artifact_key(&refs)
    }

    /// Resolve the candidates of one area.
    pub async fn resolve(
        &self,
        candidates: &[CandidateStop],
        area: &Area,
    ) -> Result<Vec<ResolvedStop>, PipelineError> {
        let (mut out, _) = self.resolve_many(&[(candidates, area)]).await?;
        Ok(out.pop().unwrap_or_default())
    }

    /// Resolve several batches at once, sharing lookups across them.
    ///
    /// Returns one `Vec<ResolvedStop>` per batch, parallel to the input.
    pub async fn resolve_many(
        &self,
        batches: &[(&[CandidateStop], &Area)],
    ) -> Result<(Vec<Vec<ResolvedStop>>, ResolveStats), PipelineError> {
        let mut stats = ResolveStats::default();

        // Unique keys not covered by a manual override, first query wins.
        let mut queries: BTreeMap<String, GeocodeQuery> = BTreeMap::new();
        for (candidates, area) in batches {
            for c in candidates.iter() {
                let key = cache_key(&area.id, &c.stop_name);
                if self.overrides.contains_key(&key) {
                    continue;
                }
                queries.entry(key).or_insert_with(|| GeocodeQuery {
                    name: c.stop_name.trim().to_string(),
                    address_hint: c.address_hint.clone(),
                    area_name: area.name.clone(),
                    center: area.center,
                });
            }
        }

        let mut outcomes: HashMap<String, KeyOutcome> = HashMap::new();
        let mut pending = Vec::new();
        for (key, query) in queries {
            let hit = match self.cache.get(&key).await {
                Some(found @ CachedResolution::Found { .. }) => Some(found),
                _ => self.cache.get(&miss_key(&key, self.provider.name())).await,
            };
            match hit {
                Some(hit) => {
                    stats.cache_hits += 1;
                    outcomes.insert(key, KeyOutcome::Confirmed(hit));
                }
                None => pending.push((key, query)),
            }
        }

        stats.provider_calls = pending.len();
        if !pending.is_empty() {
            info!(
                "Resolving {} stop names via {} ({} cached)",
                pending.len(),
                self.provider.name(),
                stats.cache_hits
            );
        }

        let looked_up: Vec<(String, KeyOutcome)> = stream::iter(pending.into_iter().map(|(key, query)| async move {
            let outcome = self.lookup_one(&query).await;
            (key, outcome)
        }))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        for (key, outcome) in looked_up {
            match &outcome {
                KeyOutcome::Confirmed(found @ CachedResolution::Found { .. }) => {
                    self.cache.insert(&key, found.clone()).await?;
                }
                KeyOutcome::Confirmed(missed @ CachedResolution::NotFound { provider }) => {
                    self.cache.insert(&miss_key(&key, provider), missed.clone()).await?;
                }
                KeyOutcome::Failed(_) => {}
            }
            outcomes.insert(key, outcome);
        }

        let mut results = Vec::with_capacity(batches.len());
        for (candidates, area) in batches {
            let mut stops = Vec::with_capacity(candidates.len());
            for c in candidates.iter() {
                stats.stops += 1;
                let key = cache_key(&area.id, &c.stop_name);
                let stop = if let Some(&(lat, lon)) = self.overrides.get(&key) {
                    stats.manual += 1;
                    ResolvedStop {
                        candidate: c.clone(),
                        lat: Some(lat),
                        lon: Some(lon),
                        method: ResolutionMethod::Manual,
                        confidence: MANUAL_CONFIDENCE,
                        resolved_by: Some("manual".to_string()),
                        unresolved_reason: None,
                    }
                } else {
                    match outcomes.get(&key) {
                        Some(KeyOutcome::Confirmed(CachedResolution::Found {
                            lat,
                            lon,
                            method,
                            confidence,
                            provider,
                            ..
                        })) => ResolvedStop {
                            candidate: c.clone(),
                            lat: Some(*lat),
                            lon: Some(*lon),
                            method: *method,
                            confidence: *confidence,
                            resolved_by: Some(provider.clone()),
                            unresolved_reason: None,
                        },
                        Some(KeyOutcome::Confirmed(CachedResolution::NotFound { .. })) => {
                            ResolvedStop::unresolved(c.clone(), "no_match")
                        }
                        Some(KeyOutcome::Failed(reason)) => ResolvedStop::unresolved(c.clone(), reason.clone()),
                        None => ResolvedStop::unresolved(c.clone(), "not_looked_up"),
                    }
                };
                if stop.coordinates().is_some() {
                    stats.resolved += 1;
                } else {
                    stats.unresolved += 1;
                }
                stops.push(stop);
            }
            results.push(stops);
        }

        Ok((results, stats))
    }

    async fn lookup_one(&self, query: &GeocodeQuery) -> KeyOutcome {
        let attempt = async {
            with_backoff(&query.name, self.retry, || async move {
                self.limiter.acquire().await;
                self.provider.lookup(query).await
            })
            .await
            .0
        };
        let result = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, attempt).await {
                Ok(r) => r,
                Err(_) => return KeyOutcome::Failed("run_timeout".to_string()),
            },
            None => attempt.await,
        };

        match result {
            Ok(matches) => match disambiguate(query, &matches) {
                Some((m, method, confidence)) => {
                    debug!(
                        "{} → {} ({:.5}, {:.5}) {:?} {:.2}",
                        query.name, m.name, m.lat, m.lon, method, confidence
                    );
                    KeyOutcome::Confirmed(CachedResolution::Found {
                        lat: m.lat,
                        lon: m.lon,
                        method,
                        confidence,
                        provider: self.provider.name().to_string(),
                        matched_name: m.name,
                    })
                }
                None => {
                    debug!("{}: no usable match", query.name);
                    KeyOutcome::Confirmed(CachedResolution::NotFound {
                        provider: self.provider.name().to_string(),
                    })
                }
            },
            Err(e) => {
                warn!("{}: geocoding failed: {}", query.name, e);
                KeyOutcome::Failed(format!("provider_error: {}", e.code()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provenance;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingGeocoder {
        calls: AtomicUsize,
        answer: Vec<GeocodeMatch>,
        fail: bool,
    }

    #[async_trait]
    impl GeocodeProvider for CountingGeocoder {
        fn name(&self) -> &str {
            "counting"
        }

        async fn lookup(&self, _query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::HttpStatus {
                    url: "geo".into(),
                    status: 401,
                });
            }
            Ok(self.answer.clone())
        }
    }

    /// Same answers as the wrapped geocoder under another provider name.
    struct Renamed(&'static str, Arc<CountingGeocoder>);

    #[async_trait]
    impl GeocodeProvider for Renamed {
        fn name(&self) -> &str {
            self.0
        }

        async fn lookup(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, FetchError> {
            self.1.lookup(query).await
        }
    }

    fn city_hall() -> GeocodeMatch {
        GeocodeMatch {
            lat: 37.5659,
            lon: 126.9771,
            name: "시청역 1호선".into(),
            address: "서울 중구 태평로1가 31".into(),
            match_type: MatchType::Partial,
        }
    }

    fn area() -> Area {
        Area {
            id: "jung".into(),
            name: "중구".into(),
            center: Some((37.5641, 126.9979)),
        }
    }

    fn candidate(name: &str) -> CandidateStop {
        CandidateStop {
            authority: "jung".into(),
            route_name: Some("1".into()),
            stop_name: name.into(),
            seq: None,
            address_hint: None,
            position: 0,
            provenance: Provenance {
                document_hash: "h".into(),
                source_url: "u".into(),
                line: 1,
                span: (0, 0),
            },
            low_confidence: false,
        }
    }

    fn query(name: &str, area_name: &str) -> GeocodeQuery {
        GeocodeQuery {
            name: name.into(),
            address_hint: None,
            area_name: area_name.into(),
            center: None,
        }
    }

    async fn resolver(dir: &TempDir, geocoder: Arc<dyn GeocodeProvider>) -> Resolver {
        let cache = GeocodeCache::load(dir.path().join("geocode-cache.jsonl")).await.unwrap();
        Resolver::new(
            geocoder,
            Arc::new(cache),
            RateLimiter::new(0),
            RetryPolicy {
                max_retries: 1,
                backoff_ms: 1,
            },
            4,
        )
    }

    #[test]
    fn normalisation_ignores_spacing_case_and_prefixes() {
        assert_eq!(normalize_key("시청역"), "시청역");
        assert_eq!(normalize_key(" 시청 역 "), "시청역");
        assert_eq!(normalize_key("서울특별시 중구 시청역"), "시청역");
        assert_eq!(normalize_key("서울 용산구 용산역"), "용산역");
        assert_eq!(normalize_key("KT 광화문 Branch"), "kt광화문branch");
        // Names that merely start like a prefix are kept.
        assert_eq!(normalize_key("서울역"), "서울역");
        assert_eq!(normalize_key("용산구청"), "용산구청");
    }

    #[test]
    fn in_area_name_match_is_exact() {
        let (_, method, conf) = disambiguate(&query("시청역", "중구"), &[GeocodeMatch {
            name: "시청역".into(),
            ..city_hall()
        }])
        .unwrap();
        assert_eq!(method, ResolutionMethod::Exact);
        assert!((conf - EXACT_IN_AREA_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn in_area_partial_is_fuzzy() {
        let (_, method, conf) = disambiguate(&query("시청역", "중구"), &[city_hall()]).unwrap();
        assert_eq!(method, ResolutionMethod::Fuzzy);
        assert!((conf - FUZZY_IN_AREA_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn out_of_area_is_never_exact() {
        let m = GeocodeMatch {
            name: "시청역".into(),
            match_type: MatchType::Exact,
            ..city_hall()
        };
        let (_, method, conf) = disambiguate(&query("시청역", "용산구"), &[m]).unwrap();
        assert_eq!(method, ResolutionMethod::Fuzzy);
        assert!((conf - OUT_OF_AREA_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn same_district_name_in_another_city_is_out_of_area() {
        let busan = GeocodeMatch {
            name: "시청역".into(),
            address: "부산 중구 중앙동 1".into(),
            match_type: MatchType::Exact,
            lat: 36.5,
            lon: 127.5,
        };
        let (_, method, conf) = disambiguate(&query("시청역", "중구"), &[busan]).unwrap();
        assert_eq!(method, ResolutionMethod::Fuzzy);
        assert!((conf - OUT_OF_AREA_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn area_match_needs_seoul_prefix() {
        assert!(address_in_area("서울 중구 태평로1가 31", "중구"));
        assert!(address_in_area("서울특별시 용산구 한강대로 405", "용산구"));
        assert!(!address_in_area("부산 중구 중앙동 1", "중구"));
        assert!(!address_in_area("서울 용산구 한강로3가", "중구"));
        assert!(address_in_area("서울 강남구 역삼동", "서울특별시"));
        assert!(!address_in_area("서울 중구", ""));
    }

    #[test]
    fn out_of_box_matches_are_discarded() {
        let far = GeocodeMatch {
            lat: 40.7,
            lon: -74.0,
            ..city_hall()
        };
        assert!(disambiguate(&query("시청역", "중구"), &[far]).is_none());
    }

    #[tokio::test]
    async fn equivalent_names_share_one_provider_call() {
        let dir = TempDir::new().unwrap();
        let geo = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![city_hall()],
            fail: false,
        });
        let r = resolver(&dir, geo.clone()).await;
        let stops = r
            .resolve(&[candidate("시청역"), candidate(" 시청 역 "), candidate("시청역")], &area())
            .await
            .unwrap();
        assert_eq!(geo.calls.load(Ordering::SeqCst), 1);
        assert!(stops.iter().all(|s| s.coordinates() == Some((37.5659, 126.9771))));

        // A second resolver over the same cache file makes no calls.
        let geo2 = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![],
            fail: false,
        });
        let r2 = resolver(&dir, geo2.clone()).await;
        let again = r2.resolve(&[candidate("시청역")], &area()).await.unwrap();
        assert_eq!(geo2.calls.load(Ordering::SeqCst), 0);
        assert_eq!(again[0].method, ResolutionMethod::Fuzzy);
    }

    #[tokio::test]
    async fn provider_failures_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let geo = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![],
            fail: true,
        });
        let r = resolver(&dir, geo.clone()).await;
        let stops = r.resolve(&[candidate("시청역")], &area()).await.unwrap();
        assert_eq!(stops[0].method, ResolutionMethod::Unresolved);
        assert_eq!(stops[0].unresolved_reason.as_deref(), Some("provider_error: http_status"));
        assert_eq!(r.cache.len().await, 0);
    }

    #[tokio::test]
    async fn no_match_is_cached_as_definitive() {
        let dir = TempDir::new().unwrap();
        let geo = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![],
            fail: false,
        });
        let r = resolver(&dir, geo.clone()).await;
        let stops = r.resolve(&[candidate("없는정류장")], &area()).await.unwrap();
        assert_eq!(stops[0].unresolved_reason.as_deref(), Some("no_match"));
        assert_eq!(r.cache.len().await, 1);

        let r2 = resolver(&dir, geo.clone()).await;
        r2.resolve(&[candidate("없는정류장")], &area()).await.unwrap();
        assert_eq!(geo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn miss_is_retried_once_a_stronger_provider_is_configured() {
        let dir = TempDir::new().unwrap();
        let offline = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![],
            fail: false,
        });
        let r1 = resolver(&dir, Arc::new(Renamed("landmarks", offline.clone()))).await;
        let first = r1.resolve(&[candidate("시청역")], &area()).await.unwrap();
        assert_eq!(first[0].unresolved_reason.as_deref(), Some("no_match"));

        let online = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![city_hall()],
            fail: false,
        });
        let r2 = resolver(&dir, Arc::new(Renamed("kakao+landmarks", online.clone()))).await;
        let second = r2.resolve(&[candidate("시청역")], &area()).await.unwrap();
        assert_eq!(online.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second[0].method, ResolutionMethod::Fuzzy);
        assert_eq!(second[0].resolved_by.as_deref(), Some("kakao+landmarks"));

        // The match now serves the offline chain as well.
        let r3 = resolver(&dir, Arc::new(Renamed("landmarks", offline.clone()))).await;
        let third = r3.resolve(&[candidate("시청역")], &area()).await.unwrap();
        assert_eq!(offline.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third[0].coordinates(), Some((37.5659, 126.9771)));
    }

    #[tokio::test]
    async fn manual_override_skips_provider() {
        let dir = TempDir::new().unwrap();
        let geo = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![city_hall()],
            fail: false,
        });
        let r = resolver(&dir, geo.clone())
            .await
            .with_overrides([("jung", "구민회관 앞", 37.5610, 126.9940)]);
        let stops = r.resolve(&[candidate("구민회관앞")], &area()).await.unwrap();
        assert_eq!(stops[0].method, ResolutionMethod::Manual);
        assert!((stops[0].confidence - 1.0).abs() < f32::EPSILON);
        assert_eq!(geo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_keeps_first_value() {
        let dir = TempDir::new().unwrap();
        let cache = GeocodeCache::load(dir.path().join("c.jsonl")).await.unwrap();
        let first = CachedResolution::NotFound {
            provider: "a".into(),
        };
        assert!(cache.insert("k", first.clone()).await.unwrap());
        assert!(!cache
            .insert(
                "k",
                CachedResolution::NotFound {
                    provider: "b".into()
                }
            )
            .await
            .unwrap());
        let reloaded = GeocodeCache::load(dir.path().join("c.jsonl")).await.unwrap();
        assert_eq!(reloaded.get("k").await, Some(first));
    }

    #[tokio::test]
    async fn fallback_uses_first_non_empty_answer() {
        let empty = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![],
            fail: false,
        });
        let full = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: vec![city_hall()],
            fail: false,
        });
        let chain = FallbackGeocoder::new(vec![
            empty.clone() as Arc<dyn GeocodeProvider>,
            full.clone() as Arc<dyn GeocodeProvider>,
        ]);
        let found = chain.lookup(&query("시청역", "중구")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(chain.name(), "counting+counting");
    }
}
