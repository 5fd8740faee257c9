//! Artifact types passed between pipeline stages.
//!
//! Each type is produced by exactly one stage and is read-only to every stage
//! downstream of it. All of them are `Serialize + Deserialize` because they are
//! persisted in the artifact store between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seoul-area bounding box: latitude range.
pub const LAT_RANGE: (f64, f64) = (33.0, 39.0);
/// Seoul-area bounding box: longitude range.
pub const LON_RANGE: (f64, f64) = (124.0, 132.0);

/// True when the coordinate lies inside the service bounding box.
pub fn in_bounds(lat: f64, lon: f64) -> bool {
    (LAT_RANGE.0..=LAT_RANGE.1).contains(&lat) && (LON_RANGE.0..=LON_RANGE.1).contains(&lon)
}

// ── Sources and documents ────────────────────────────────────────────────────

/// What kind of document a source URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Html,
    Pdf,
    Image,
}

impl DocumentKind {
    /// Guess the kind from a URL path extension.
    pub fn from_url(url: &str) -> DocumentKind {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();
        if path.ends_with(".pdf") {
            DocumentKind::Pdf
        } else if [".png", ".jpg", ".jpeg", ".gif", ".webp"]
            .iter()
            .any(|ext| path.ends_with(ext))
        {
            DocumentKind::Image
        } else {
            DocumentKind::Html
        }
    }

    /// Refine the declared kind with the response's content type.
    pub fn from_content_type(content_type: &str, fallback: DocumentKind) -> DocumentKind {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("application/pdf") {
            DocumentKind::Pdf
        } else if ct.starts_with("image/") {
            DocumentKind::Image
        } else if ct.contains("text/html") || ct.contains("application/xhtml") {
            DocumentKind::Html
        } else {
            fallback
        }
    }

    pub fn needs_ocr(self) -> bool {
        !matches!(self, DocumentKind::Html)
    }
}

/// One origin of shuttle information.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub authority: String,
    pub url: String,
    pub kind: DocumentKind,
    /// URL of the listing page this source was discovered on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<String>,
}

impl Source {
    pub fn new(authority: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let kind = DocumentKind::from_url(&url);
        Self {
            authority: authority.into(),
            url,
            kind,
            discovered_from: None,
        }
    }

    pub fn with_kind(mut self, kind: DocumentKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Metadata of fetched bytes. The bytes themselves live in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub source: Source,
    /// SHA-256 of the body, lowercase hex.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
    pub content_type: Option<String>,
    pub byte_len: usize,
    /// Kind after content-type sniffing.
    pub kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Html,
    Ocr,
}

/// Plain text derived from one raw document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub authority: String,
    pub source_url: String,
    /// Hash of the raw document this text came from.
    pub document_hash: String,
    pub method: ExtractionMethod,
    pub text: String,
    /// OCR confidence in [0,1]; `None` for HTML.
    pub confidence: Option<f32>,
    pub low_confidence: bool,
    /// Name of the engine that produced OCR text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

// ── Structuring ──────────────────────────────────────────────────────────────

/// Where in the extracted text a candidate was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_hash: String,
    pub source_url: String,
    /// 1-based line number in the extracted text.
    pub line: usize,
    /// Byte span within that line.
    pub span: (usize, usize),
}

/// One tentative stop extracted from text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateStop {
    pub authority: String,
    pub route_name: Option<String>,
    pub stop_name: String,
    pub seq: Option<u32>,
    pub address_hint: Option<String>,
    /// Position in document order; tie-break for sequence inference.
    pub position: usize,
    pub provenance: Provenance,
    /// Inherited from the extracted text.
    #[serde(default)]
    pub low_confidence: bool,
}

/// Operating details captured next to a route block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNote {
    /// Authority of the section the note was found in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    pub route_name: Option<String>,
    pub hours: Option<String>,
    pub interval: Option<String>,
}

/// Output of the Structurer for one extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub authority: String,
    pub document_hash: String,
    pub candidates: Vec<CandidateStop>,
    #[serde(default)]
    pub notes: Vec<RouteNote>,
}

// ── Resolution ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Exact,
    Fuzzy,
    Manual,
    Unresolved,
}

/// A candidate stop with coordinates (or the recorded lack of them).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStop {
    pub candidate: CandidateStop,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub method: ResolutionMethod,
    pub confidence: f32,
    /// Provider that answered, or why nothing did.
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved_reason: Option<String>,
}

impl ResolvedStop {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.method, self.lat, self.lon) {
            (ResolutionMethod::Unresolved, _, _) => None,
            (_, Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn unresolved(candidate: CandidateStop, reason: impl Into<String>) -> Self {
        Self {
            candidate,
            lat: None,
            lon: None,
            method: ResolutionMethod::Unresolved,
            confidence: 0.0,
            resolved_by: None,
            unresolved_reason: Some(reason.into()),
        }
    }
}

/// Output of the Resolver for one structured document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDocument {
    pub authority: String,
    pub document_hash: String,
    pub stops: Vec<ResolvedStop>,
    #[serde(default)]
    pub notes: Vec<RouteNote>,
}

// ── Routes and verdicts ──────────────────────────────────────────────────────

/// Stops sharing an authority and route name, in path order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub authority: String,
    pub route_name: Option<String>,
    /// Document the route was assembled from.
    pub document_hash: String,
    pub stops: Vec<ResolvedStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl Route {
    /// Identifier used in reports and discards.
    pub fn label(&self) -> String {
        format!(
            "{}/{}",
            self.authority,
            self.route_name.as_deref().unwrap_or("<unnamed>")
        )
    }
}

/// Validator outcome for a route or a stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reasons", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Flagged(Vec<String>),
    Rejected(Vec<String>),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Verdict::Rejected(_))
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            Verdict::Accepted => &[],
            Verdict::Flagged(r) | Verdict::Rejected(r) => r,
        }
    }
}

/// A route together with its verdicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRoute {
    pub route: Route,
    pub verdict: Verdict,
    /// One verdict per stop, parallel to `route.stops`.
    pub stop_verdicts: Vec<Verdict>,
}

// ── Published dataset ────────────────────────────────────────────────────────

/// One stop as the map page consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedStop {
    pub name: String,
    pub seq: u32,
    pub lat: f64,
    pub lon: f64,
    pub confidence: f32,
}

/// One route as the map page consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedRoute {
    pub authority: String,
    pub route_name: String,
    pub stops: Vec<PublishedStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_edges() {
        assert!(in_bounds(37.5665, 126.9780));
        assert!(in_bounds(33.0, 124.0));
        assert!(in_bounds(39.0, 132.0));
        assert!(!in_bounds(40.7, -74.0));
        assert!(!in_bounds(37.5, 123.99));
    }

    #[test]
    fn kind_from_url() {
        assert_eq!(DocumentKind::from_url("https://a.kr/f/route.PDF"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_url("https://a.kr/map.jpg?v=2"), DocumentKind::Image);
        assert_eq!(DocumentKind::from_url("https://a.kr/board/view.do?id=3"), DocumentKind::Html);
    }

    #[test]
    fn content_type_overrides_url_guess() {
        assert_eq!(
            DocumentKind::from_content_type("application/pdf", DocumentKind::Html),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::from_content_type("application/octet-stream", DocumentKind::Image),
            DocumentKind::Image
        );
    }

    #[test]
    fn published_route_uses_camel_case() {
        let route = PublishedRoute {
            authority: "yongsan".into(),
            route_name: "402".into(),
            stops: vec![],
            hours: None,
            interval: None,
        };
        let json = serde_json::to_string(&route).unwrap();
        assert!(json.contains("\"routeName\":\"402\""), "got: {json}");
        assert!(!json.contains("hours"));
    }

    #[test]
    fn verdict_serialises_reasons() {
        let v = Verdict::Flagged(vec!["duplicate".into()]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"verdict":"flagged","reasons":["duplicate"]}"#);
        let a = serde_json::to_string(&Verdict::Accepted).unwrap();
        assert_eq!(a, r#"{"verdict":"accepted"}"#);
    }
}
