//! Validate: assemble routes from resolved stops and judge them.
//!
//! ## Assembly
//!
//! Stops group by `(authority, route name)` in document order, using each
//! stop's own authority so the district sections of a city-wide notice
//! become separate routes. When several documents describe the same route
//! the first document in source order wins and the others are recorded as
//! `superseded`. Stops without a route name form one unnamed route per
//! document and authority. Unknown sequence indices are
//! inferred as previous + 1, starting at 0.
//!
//! ## Checks
//!
//! | Check | Outcome |
//! |-------|---------|
//! | authority, route name, ≥ 2 resolved stops | `rejected` |
//! | a coordinate outside the bounding box | `rejected(out_of_bounds)` |
//! | sequence regression or repeat | `flagged(sequence)` |
//! | same name within `duplicate_distance_m` | `flagged(duplicate)` |
//! | unresolved stops | `flagged(unresolved_stops)`; the stop is rejected |
//! | low-confidence OCR text | `flagged(low_confidence)` |

use crate::config::Stage;
use crate::model::{in_bounds, ResolvedDocument, ResolvedStop, Route, ValidatedRoute, Verdict};
use crate::pipeline::resolve::normalize_key;
use crate::report::{Discard, ValidationSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two `(lat, lon)` points in metres.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Verdicts for every assembled route, plus assembly discards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub routes: Vec<ValidatedRoute>,
    /// Routes dropped during assembly (`superseded`).
    #[serde(default)]
    pub discards: Vec<Discard>,
}

impl ValidationOutcome {
    pub fn accepted(&self) -> impl Iterator<Item = &ValidatedRoute> {
        self.routes.iter().filter(|r| r.verdict.is_accepted())
    }

    pub fn flagged(&self) -> impl Iterator<Item = &ValidatedRoute> {
        self.routes
            .iter()
            .filter(|r| matches!(r.verdict, Verdict::Flagged(_)))
    }

    pub fn rejected(&self) -> impl Iterator<Item = &ValidatedRoute> {
        self.routes.iter().filter(|r| r.verdict.is_rejected())
    }

    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary {
            routes: self.routes.len(),
            accepted: self.accepted().count(),
            flagged: self.flagged().count(),
            rejected: self.rejected().count(),
        }
    }
}

// ── Assembly ─────────────────────────────────────────────────────────────────

/// Fill unknown sequence indices with previous + 1.
fn infer_sequence(stops: &mut [ResolvedStop]) {
    let mut prev: Option<u32> = None;
    for stop in stops.iter_mut() {
        let seq = match stop.candidate.seq {
            Some(s) => s,
            None => prev.map_or(0, |p| p + 1),
        };
        stop.candidate.seq = Some(seq);
        prev = Some(seq);
    }
}

/// Group resolved documents into routes.
///
/// `documents` must be in source order; the returned routes follow the order
/// in which each route first appears.
pub fn assemble_routes(documents: &[ResolvedDocument]) -> (Vec<Route>, Vec<Discard>) {
    let mut routes: Vec<Route> = Vec::new();
    // (authority, route name) → index into `routes`, with the owning document.
    let mut owners: HashMap<(String, String), usize> = HashMap::new();
    let mut discards = Vec::new();

    for doc in documents {
        let mut stops: Vec<&ResolvedStop> = doc.stops.iter().collect();
        stops.sort_by_key(|s| s.candidate.position);

        let mut unnamed: HashMap<String, usize> = HashMap::new();
        let mut superseded_here: Vec<(String, String)> = Vec::new();

        for stop in stops {
            let authority = stop.candidate.authority.clone();
            let Some(name) = stop.candidate.route_name.clone() else {
                let idx = *unnamed.entry(authority.clone()).or_insert_with(|| {
                    routes.push(Route {
                        authority: authority.clone(),
                        route_name: None,
                        document_hash: doc.document_hash.clone(),
                        stops: Vec::new(),
                        hours: None,
                        interval: None,
                    });
                    routes.len() - 1
                });
                routes[idx].stops.push(stop.clone());
                continue;
            };

            let key = (authority.clone(), name.clone());
            match owners.get(&key) {
                Some(&idx) if routes[idx].document_hash == doc.document_hash => {
                    routes[idx].stops.push(stop.clone());
                }
                Some(&idx) => {
                    if !superseded_here.contains(&key) {
                        superseded_here.push(key.clone());
                        let label = routes[idx].label();
                        debug!("{}: superseded by {}", label, &routes[idx].document_hash);
                        discards.push(Discard {
                            stage: Stage::Validate,
                            item: format!("{}@{}", label, doc.document_hash),
                            reason: "superseded".to_string(),
                            detail: format!("already described by document {}", routes[idx].document_hash),
                            cached: false,
                        });
                    }
                }
                None => {
                    let note = doc.notes.iter().find(|n| {
                        n.route_name.as_deref() == Some(name.as_str())
                            && n.authority.as_deref().is_none_or(|a| a == authority)
                    });
                    routes.push(Route {
                        authority: authority.clone(),
                        route_name: Some(name),
                        document_hash: doc.document_hash.clone(),
                        stops: vec![stop.clone()],
                        hours: note.and_then(|n| n.hours.clone()),
                        interval: note.and_then(|n| n.interval.clone()),
                    });
                    owners.insert(key, routes.len() - 1);
                }
            }
        }
    }

    for route in &mut routes {
        infer_sequence(&mut route.stops);
    }
    (routes, discards)
}

// ── Checks ───────────────────────────────────────────────────────────────────

fn push_reason(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(reason.to_string());
    }
}

fn verdict_from(rejected: Vec<String>, flagged: Vec<String>) -> Verdict {
    if !rejected.is_empty() {
        Verdict::Rejected(rejected)
    } else if !flagged.is_empty() {
        Verdict::Flagged(flagged)
    } else {
        Verdict::Accepted
    }
}

/// Judge one route.
pub fn validate_route(route: Route, duplicate_distance_m: f64) -> ValidatedRoute {
    let n = route.stops.len();
    let mut stop_rejected: Vec<Vec<String>> = vec![Vec::new(); n];
    let mut stop_flagged: Vec<Vec<String>> = vec![Vec::new(); n];
    let mut rejected = Vec::new();
    let mut flagged = Vec::new();

    // (a) schema
    if route.authority.trim().is_empty() {
        push_reason(&mut rejected, "missing_authority");
    }
    if route.route_name.as_deref().is_none_or(|name| name.trim().is_empty()) {
        push_reason(&mut rejected, "missing_route_name");
    }
    let resolved = route.stops.iter().filter(|s| s.coordinates().is_some()).count();
    if resolved < 2 {
        push_reason(&mut rejected, "too_few_stops");
    }

    for (i, stop) in route.stops.iter().enumerate() {
        match stop.coordinates() {
            None => {
                push_reason(&mut stop_rejected[i], "unresolved");
                push_reason(&mut flagged, "unresolved_stops");
            }
            // (b) bounding box
            Some((lat, lon)) if !in_bounds(lat, lon) => {
                push_reason(&mut stop_rejected[i], "out_of_bounds");
                push_reason(&mut rejected, "out_of_bounds");
            }
            Some(_) => {}
        }
        if stop.candidate.low_confidence {
            push_reason(&mut stop_flagged[i], "low_confidence");
            push_reason(&mut flagged, "low_confidence");
        }
    }

    // (c) monotonic sequence
    let mut last: Option<u32> = None;
    for (i, stop) in route.stops.iter().enumerate() {
        let Some(seq) = stop.candidate.seq else { continue };
        if last.is_some_and(|l| seq <= l) {
            push_reason(&mut stop_flagged[i], "sequence");
            push_reason(&mut flagged, "sequence");
        }
        last = Some(last.map_or(seq, |l| l.max(seq)));
    }

    // (d) duplicate stops
    let keys: Vec<String> = route
        .stops
        .iter()
        .map(|s| normalize_key(&s.candidate.stop_name))
        .collect();
    for j in 1..n {
        let Some(b) = route.stops[j].coordinates() else { continue };
        let duplicate = (0..j).any(|i| {
            keys[i] == keys[j]
                && route.stops[i]
                    .coordinates()
                    .is_some_and(|a| haversine_m(a, b) <= duplicate_distance_m)
        });
        if duplicate {
            push_reason(&mut stop_flagged[j], "duplicate");
            push_reason(&mut flagged, "duplicate");
        }
    }

    let stop_verdicts = stop_rejected
        .into_iter()
        .zip(stop_flagged)
        .map(|(r, f)| verdict_from(r, f))
        .collect();

    ValidatedRoute {
        verdict: verdict_from(rejected, flagged),
        route,
        stop_verdicts,
    }
}

/// Judge assembled routes.
pub fn validate(routes: Vec<Route>, duplicate_distance_m: f64) -> ValidationOutcome {
    let routes: Vec<ValidatedRoute> = routes
        .into_iter()
        .map(|r| validate_route(r, duplicate_distance_m))
        .collect();
    for r in &routes {
        debug!("{}: {:?}", r.route.label(), r.verdict);
    }
    ValidationOutcome {
        routes,
        discards: Vec::new(),
    }
}

/// Assemble and judge the resolved documents of a run.
pub fn validate_documents(documents: &[ResolvedDocument], duplicate_distance_m: f64) -> ValidationOutcome {
    let (routes, discards) = assemble_routes(documents);
    let mut outcome = validate(routes, duplicate_distance_m);
    outcome.discards = discards;
    let s = outcome.summary();
    info!(
        "Validated {} routes: {} accepted, {} flagged, {} rejected ({} superseded)",
        s.routes,
        s.accepted,
        s.flagged,
        s.rejected,
        outcome.discards.len()
    );
    outcome
}
