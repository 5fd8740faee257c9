//! Publish: turn validated routes into the dataset the map page reads.
//!
//! Accepted routes, plus flagged ones when `publish_flagged` is set, are
//! stripped of rejected stops and re-checked: sequence strictly increasing,
//! every coordinate inside the bounding box, at least two stops. The result
//! is sorted by `(authority, routeName)` and pretty-printed, so identical
//! inputs always produce identical bytes. The file is replaced only when its
//! SHA-256 changes.
//!
//! Every non-empty dataset is also scored: how many of the 25 districts it
//! covers, how often routes carry hours and interval, and stops per route.

use crate::config::Stage;
use crate::error::{AbortReason, PipelineError};
use crate::model::{in_bounds, PublishedRoute, PublishedStop, ValidatedRoute, Verdict};
use crate::pipeline::validate::ValidationOutcome;
use crate::pipeline::landmarks::seoul_districts;
use crate::report::{DatasetQuality, Discard, PublishOutcome};
use std::collections::BTreeSet;
use crate::store::{compute_hash, ArtifactStore};
use tracing::{debug, info, warn};

fn discard(item: String, reason: &str, detail: String) -> Discard {
    Discard {
        stage: Stage::Publish,
        item,
        reason: reason.to_string(),
        detail,
        cached: false,
    }
}

/// Why an assembled route breaks a dataset invariant, if it does.
pub fn invariant_violation(route: &PublishedRoute) -> Option<String> {
    if route.stops.len() < 2 {
        return Some(format!("{} stops, need at least 2", route.stops.len()));
    }
    if let Some(w) = route.stops.windows(2).find(|w| w[1].seq <= w[0].seq) {
        return Some(format!("sequence {} follows {}", w[1].seq, w[0].seq));
    }
    if let Some(s) = route.stops.iter().find(|s| !in_bounds(s.lat, s.lon)) {
        return Some(format!("'{}' at ({}, {}) is outside the service area", s.name, s.lat, s.lon));
    }
    None
}

fn to_published(validated: &ValidatedRoute, discards: &mut Vec<Discard>) -> Option<PublishedRoute> {
    let route = &validated.route;
    let label = route.label();
    let route_name = route.route_name.clone()?;

    let mut stops = Vec::with_capacity(route.stops.len());
    for (stop, verdict) in route.stops.iter().zip(&validated.stop_verdicts) {
        let name = stop.candidate.stop_name.trim().to_string();
        let coords = stop.coordinates();
        match (verdict, coords, stop.candidate.seq) {
            (Verdict::Rejected(reasons), _, _) => {
                discards.push(discard(format!("{label}/{name}"), "stop_rejected", reasons.join(", ")));
            }
            (_, Some((lat, lon)), Some(seq)) => stops.push(PublishedStop {
                name,
                seq,
                lat,
                lon,
                confidence: stop.confidence,
            }),
            _ => {
                discards.push(discard(
                    format!("{label}/{name}"),
                    "stop_rejected",
                    "no coordinates or sequence".to_string(),
                ));
            }
        }
    }

    Some(PublishedRoute {
        authority: route.authority.clone(),
        route_name,
        stops,
        hours: route.hours.clone(),
        interval: route.interval.clone(),
    })
}

/// Select and shape the publishable routes. Rejected routes are ignored;
/// they were already reported by the Validate stage.
pub fn assemble_dataset(outcome: &ValidationOutcome, publish_flagged: bool) -> (Vec<PublishedRoute>, Vec<Discard>) {
    let mut routes = Vec::new();
    let mut discards = Vec::new();

    for validated in &outcome.routes {
        match &validated.verdict {
            Verdict::Rejected(_) => continue,
            Verdict::Flagged(reasons) if !publish_flagged => {
                discards.push(discard(validated.route.label(), "flagged_withheld", reasons.join(", ")));
                continue;
            }
            _ => {}
        }
        let Some(route) = to_published(validated, &mut discards) else {
            continue;
        };
        match invariant_violation(&route) {
            Some(detail) => {
                warn!("{}: not published: {}", validated.route.label(), detail);
                discards.push(discard(validated.route.label(), "invariant_violation", detail));
            }
            None => routes.push(route),
        }
    }

    routes.sort_by(|a, b| {
        a.authority
            .cmp(&b.authority)
            .then_with(|| a.route_name.cmp(&b.route_name))
    });
    (routes, discards)
}

/// Deterministic bytes for a dataset.
pub fn serialize_dataset(routes: &[PublishedRoute]) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(routes)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Score a dataset. An empty dataset scores zero everywhere.
pub fn dataset_quality(routes: &[PublishedRoute]) -> DatasetQuality {
    if routes.is_empty() {
        return DatasetQuality::default();
    }
    let districts = routes.iter().map(|r| r.authority.as_str()).collect::<BTreeSet<_>>().len();
    let stops: usize = routes.iter().map(|r| r.stops.len()).sum();
    let filled = routes
        .iter()
        .map(|r| usize::from(r.hours.is_some()) + usize::from(r.interval.is_some()))
        .sum::<usize>();

    let total_districts = seoul_districts().count() as f64;
    let coverage = (districts as f64 / total_districts * 100.0).min(100.0);
    let completeness = filled as f64 / (routes.len() * 2) as f64 * 100.0;

    DatasetQuality {
        districts,
        routes: routes.len(),
        stops,
        district_coverage: round1(coverage),
        info_completeness: round1(completeness),
        avg_stops_per_route: round1(stops as f64 / routes.len() as f64),
        overall_score: round1((coverage + completeness) / 2.0),
    }
}

/// Result of the Publish stage.
#[derive(Debug)]
pub struct Publication {
    pub outcome: PublishOutcome,
    pub discards: Vec<Discard>,
    /// `None` when nothing was assembled.
    pub quality: Option<DatasetQuality>,
}

/// Assemble the dataset and write it if it differs from the current file.
///
/// An empty dataset never replaces an existing one; it yields
/// [`PublishOutcome::Aborted`] with [`AbortReason::NothingToPublish`].
pub async fn publish(
    store: &ArtifactStore,
    outcome: &ValidationOutcome,
    publish_flagged: bool,
) -> Result<Publication, PipelineError> {
    let (routes, discards) = assemble_dataset(outcome, publish_flagged);
    if routes.is_empty() {
        warn!("Nothing to publish; keeping the current dataset");
        return Ok(Publication {
            outcome: PublishOutcome::Aborted {
                reason: AbortReason::NothingToPublish,
            },
            discards,
            quality: None,
        });
    }

    let quality = dataset_quality(&routes);
    info!(
        "Dataset quality {:.1} (coverage {:.1}%, completeness {:.1}%)",
        quality.overall_score, quality.district_coverage, quality.info_completeness
    );

    let bytes = serialize_dataset(&routes).map_err(|e| PipelineError::Serialization {
        path: store.published_path(),
        detail: e.to_string(),
    })?;
    let hash = compute_hash(&bytes);
    let count = routes.len();

    let outcome = if store.published_hash().await?.as_deref() == Some(hash.as_str()) {
        debug!("Dataset unchanged ({})", &hash[..12]);
        PublishOutcome::Unchanged { hash, routes: count }
    } else {
        store.write_published(&bytes).await?;
        info!(
            "Published {} routes to {} ({})",
            count,
            store.published_path().display(),
            &hash[..12]
        );
        PublishOutcome::Published { hash, routes: count }
    };
    Ok(Publication {
        outcome,
        discards,
        quality: Some(quality),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CandidateStop, Provenance, ResolutionMethod, ResolvedStop, Route};
    use tempfile::TempDir;

    fn stop(name: &str, seq: u32, lat: f64, lon: f64) -> ResolvedStop {
        ResolvedStop {
            candidate: CandidateStop {
                authority: "yongsan".into(),
                route_name: Some("402".into()),
                stop_name: name.into(),
                seq: Some(seq),
                address_hint: None,
                position: seq as usize,
                provenance: Provenance {
                    document_hash: "d".into(),
                    source_url: "u".into(),
                    line: 1,
                    span: (0, 0),
                },
                low_confidence: false,
            },
            lat: Some(lat),
            lon: Some(lon),
            method: ResolutionMethod::Exact,
            confidence: 0.95,
            resolved_by: Some("test".into()),
            unresolved_reason: None,
        }
    }

    fn validated(authority: &str, name: &str, verdict: Verdict, stops: Vec<ResolvedStop>) -> ValidatedRoute {
        let stop_verdicts = vec![Verdict::Accepted; stops.len()];
        ValidatedRoute {
            route: Route {
                authority: authority.into(),
                route_name: Some(name.into()),
                document_hash: "d".into(),
                stops,
                hours: None,
                interval: None,
            },
            verdict,
            stop_verdicts,
        }
    }

    fn two_stops() -> Vec<ResolvedStop> {
        vec![
            stop("시청역", 0, 37.5659, 126.9771),
            stop("서울역", 1, 37.5547, 126.9707),
        ]
    }

    fn outcome(routes: Vec<ValidatedRoute>) -> ValidationOutcome {
        ValidationOutcome {
            routes,
            discards: vec![],
        }
    }

    #[test]
    fn output_is_sorted_by_authority_then_route() {
        let o = outcome(vec![
            validated("yongsan", "402", Verdict::Accepted, two_stops()),
            validated("jung", "2", Verdict::Accepted, two_stops()),
            validated("jung", "1", Verdict::Accepted, two_stops()),
        ]);
        let (routes, _) = assemble_dataset(&o, true);
        let keys: Vec<_> = routes
            .iter()
            .map(|r| (r.authority.as_str(), r.route_name.as_str()))
            .collect();
        assert_eq!(keys, vec![("jung", "1"), ("jung", "2"), ("yongsan", "402")]);
    }

    #[test]
    fn flagged_routes_follow_the_switch() {
        let o = outcome(vec![validated(
            "jung",
            "1",
            Verdict::Flagged(vec!["duplicate".into()]),
            two_stops(),
        )]);
        assert_eq!(assemble_dataset(&o, true).0.len(), 1);
        let (routes, discards) = assemble_dataset(&o, false);
        assert!(routes.is_empty());
        assert_eq!(discards[0].reason, "flagged_withheld");
    }

    #[test]
    fn rejected_stops_are_dropped_and_route_rechecked() {
        let mut v = validated(
            "jung",
            "1",
            Verdict::Flagged(vec!["unresolved_stops".into()]),
            two_stops(),
        );
        v.stop_verdicts[1] = Verdict::Rejected(vec!["unresolved".into()]);
        let (routes, discards) = assemble_dataset(&outcome(vec![v]), true);
        assert!(routes.is_empty(), "one remaining stop is not a route");
        let reasons: Vec<_> = discards.iter().map(|d| d.reason.as_str()).collect();
        assert_eq!(reasons, vec!["stop_rejected", "invariant_violation"]);
    }

    #[test]
    fn json_uses_map_page_field_names() {
        let o = outcome(vec![validated("yongsan", "402", Verdict::Accepted, two_stops())]);
        let (routes, _) = assemble_dataset(&o, true);
        let json = String::from_utf8(serialize_dataset(&routes).unwrap()).unwrap();
        assert!(json.contains("\"routeName\": \"402\""), "got: {json}");
        assert!(json.contains("\"seq\": 1"));
        assert!(json.ends_with("]\n"));
    }

    #[tokio::test]
    async fn second_publish_of_same_data_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let o = outcome(vec![validated("yongsan", "402", Verdict::Accepted, two_stops())]);

        let first = publish(&store, &o, true).await.unwrap().outcome;
        let second = publish(&store, &o, true).await.unwrap();
        assert!(second.quality.is_some());
        let second = second.outcome;
        let PublishOutcome::Published { hash, routes } = first else {
            panic!("expected Published, got {first:?}");
        };
        assert_eq!(routes, 1);
        assert_eq!(second, PublishOutcome::Unchanged { hash, routes: 1 });
    }

    #[tokio::test]
    async fn empty_dataset_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let good = outcome(vec![validated("yongsan", "402", Verdict::Accepted, two_stops())]);
        publish(&store, &good, true).await.unwrap();
        let before = store.published_hash().await.unwrap();

        let result = publish(&store, &outcome(vec![]), true).await.unwrap();
        assert_eq!(result.quality, None);
        assert_eq!(
            result.outcome,
            PublishOutcome::Aborted {
                reason: AbortReason::NothingToPublish
            }
        );
        assert_eq!(store.published_hash().await.unwrap(), before);
    }

    #[test]
    fn quality_scores_coverage_and_completeness() {
        let mut with_hours = validated("yongsan", "402", Verdict::Accepted, two_stops());
        with_hours.route.hours = Some("09:00~18:00".into());
        let o = outcome(vec![
            with_hours,
            validated("jung", "1", Verdict::Accepted, two_stops()),
            validated("jung", "2", Verdict::Accepted, two_stops()),
        ]);
        let (routes, _) = assemble_dataset(&o, true);
        let q = dataset_quality(&routes);
        assert_eq!((q.districts, q.routes, q.stops), (2, 3, 6));
        assert_eq!(q.district_coverage, 8.0);
        // 1 of 6 fields
        assert_eq!(q.info_completeness, 16.7);
        assert_eq!(q.avg_stops_per_route, 2.0);
        // (8 + 16.666..) / 2
        assert_eq!(q.overall_score, 12.3);
    }

    #[test]
    fn empty_dataset_scores_zero() {
        assert_eq!(dataset_quality(&[]), DatasetQuality::default());
    }
}
