//! Structure: segment extracted text into route blocks and candidate stops.
//!
//! The text is read line by line. A route header (`402번 노선`, `노선 3`,
//! `1호차`, `A코스`, `남산 순환 셔틀:`, `[ … ]`) opens a new block; lines
//! before the first header belong to an unnamed block. Within a block each
//! line yields stops through the first rule that matches:
//!
//! 1. **Arrow chain**: `시청역 → 서울역 → 용산역`. Ordered, seq assigned
//!    from a per-block counter.
//! 2. **Numbered line**: `1. 시청역`, `② 서울역`. Seq is the number minus one.
//! 3. **Keyword stops**: any `…역`, `…정류장`, `…사거리`, `…입구`, `…앞`, …
//!    token, seq unknown.
//!
//! Parenthesised text after a stop becomes its address hint. Operating hours
//! and headways are captured per block as [`RouteNote`]s.
//!
//! ## District sections
//!
//! City-wide notices list several districts one after another. A line that
//! starts with a Seoul district name (`■ 용산구`, `[강남구] 402번 노선`,
//! `서울특별시 중구:`) opens a district section: stops until the next
//! section are attributed to the authority the [`DistrictMap`] gives for
//! that district instead of the authority that listed the document.

use crate::error::StructuringError;
use crate::model::{CandidateStop, ExtractedText, Provenance, RouteNote, StructuredDocument};
use crate::pipeline::landmarks::seoul_districts;
use crate::store::artifact_key;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Bumped whenever segmentation rules change; part of the structured
/// artifact key so old artifacts are not reused.
pub const STRUCTURER_VERSION: &str = "structurer-4";

/// Words that never form part of a stop name.
const SCHEDULE_WORDS: &[&str] = &["운행", "시간", "배차", "간격", "안내", "문의", "연락처"];

/// Lines carrying contact details; keyword matches there are office names.
const CONTACT_WORDS: &[&str] = &["문의", "연락처", "전화", "홈페이지", "담당"];

/// `…역` endings that are ordinary nouns, not stations.
const FALSE_STATION_SUFFIXES: &[&str] = &["지역", "구역", "영역", "무역", "전역"];

/// Title words that do not name a route on their own.
const GENERIC_TITLE_WORDS: &[&str] = &["무료", "셔틀", "버스", "순환", "운행", "안내", "공지", "마을"];

// ── Patterns ─────────────────────────────────────────────────────────────────

static RE_ROUTE_NUMBERED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*•·]\s*)?(?P<name>\d{1,4}[A-Za-z]?)\s*번?\s*(?:노선|셔틀)").unwrap()
});

static RE_ROUTE_PREFIXED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[-*•·]\s*)?노선\s*(?P<name>\d{1,4}[A-Za-z]?)(?:\s*번)?").unwrap()
});

static RE_ROUTE_CAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•·]\s*)?(?P<name>\d{1,2}\s*호차)").unwrap());

static RE_ROUTE_COURSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•·]\s*)?(?P<name>[A-Za-z0-9가-힣]{1,4}\s*코스)").unwrap());

static RE_ROUTE_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[\[【〔]\s*(?P<name>[^\]】〕]{1,30}?)\s*[\]】〕]").unwrap());

static RE_ROUTE_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?P<name>[가-힣A-Za-z0-9]{1,10}(?:\s+[가-힣A-Za-z0-9]{1,10})?\s*(?:순환|셔틀)(?:버스|선)?)\s*(?:[:：]|$)",
    )
    .unwrap()
});

static RE_ARROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*(?:→|↔|⇒|➡|⟶|->)\s*").unwrap());

static RE_NUMBERED_STOP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:(?P<num>\d{1,2})\s*[.)]\s+|(?P<circled>[①-⑳])\s*)(?P<rest>\S.*)$").unwrap()
});

static RE_STOP_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<name>[가-힣A-Za-z0-9]{1,15}(?:역|정류장|정류소|사거리|삼거리|오거리|주민센터|구청|시장|공원|학교|병원|아파트|마을|입구|건너편|앞)(?:\s?(?:앞|건너편|입구))?(?:\s*\d{1,2}번\s*출구)?)(?:\s*\((?P<hint>[^)]{1,60})\))?",
    )
    .unwrap()
});

static RE_TIME_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})\s*[:시]\s*(\d{2})?\s*(?:분)?\s*[~\-]\s*(\d{1,2})\s*[:시]\s*(\d{2})?").unwrap()
});

static RE_DISTRICT_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*[-*•·■□◆◇▶▷○●#<\[【〔(]*\s*(?:서울(?:특별시|시)?\s*)?(?P<district>[가-힣]{1,3}구)\s*[>\]】〕)]?\s*(?:[:：]|\s|$)",
    )
    .unwrap()
});

static RE_INTERVAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*[~\-]?\s*(\d+)?\s*분\s*(?:간격|배차)?").unwrap());

static RE_TRAILING_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\d{1,2}\s*[:시]\s*\d{0,2}\s*분?\s*$").unwrap());

static RE_TIME_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d{1,2}\s*[:시]\s*\d{0,2}\s*분?\s*$").unwrap());

// ── District sections ────────────────────────────────────────────────────────

/// District names recognised as section headers, each mapped to the
/// authority id its stops are attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistrictMap {
    ids: BTreeMap<String, String>,
}

impl DistrictMap {
    /// No sections: every stop stays with the document's authority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every Seoul district, identified by its own name.
    pub fn seoul() -> Self {
        Self {
            ids: seoul_districts().map(|d| (d.to_string(), d.to_string())).collect(),
        }
    }

    /// Attribute `district` sections to `authority`.
    pub fn with_authority(mut self, district: impl Into<String>, authority: impl Into<String>) -> Self {
        self.ids.insert(district.into(), authority.into());
        self
    }

    pub fn authority_for(&self, district: &str) -> Option<&str> {
        self.ids.get(district).map(String::as_str)
    }

    /// Identifies the mapping; part of the structured artifact key.
    pub fn fingerprint(&self) -> String {
        let pairs: Vec<String> = self.ids.iter().map(|(d, id)| format!("{d}={id}")).collect();
        let refs: Vec<&str> = pairs.iter().map(String::as_str).collect();
        artifact_key(&refs)
    }
}

/// Authority and header end offset, if `line` opens a district section.
fn district_header<'a>(line: &str, districts: &'a DistrictMap) -> Option<(&'a str, usize)> {
    let caps = RE_DISTRICT_HEADER.captures(line)?;
    let authority = districts.authority_for(&caps["district"])?;
    Some((authority, caps.get(0)?.end()))
}

// ── Route headers ────────────────────────────────────────────────────────────

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_generic_title(name: &str) -> bool {
    let mut rest: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    for word in GENERIC_TITLE_WORDS.iter().chain(SCHEDULE_WORDS) {
        rest = rest.replace(word, "");
    }
    rest.is_empty()
}

/// Route name and the byte offset where the header ends, if `line` opens a
/// new route block.
fn route_header(line: &str) -> Option<(String, usize)> {
    if let Some(c) = RE_ROUTE_NUMBERED.captures(line) {
        return Some((c["name"].to_string(), c.get(0)?.end()));
    }
    if let Some(c) = RE_ROUTE_PREFIXED.captures(line) {
        return Some((c["name"].to_string(), c.get(0)?.end()));
    }
    if let Some(c) = RE_ROUTE_CAR.captures(line) {
        let name: String = c["name"].chars().filter(|ch| !ch.is_whitespace()).collect();
        return Some((name, c.get(0)?.end()));
    }
    if let Some(c) = RE_ROUTE_COURSE.captures(line) {
        let name: String = c["name"].chars().filter(|ch| !ch.is_whitespace()).collect();
        return Some((name, c.get(0)?.end()));
    }
    if let Some(c) = RE_ROUTE_BRACKET.captures(line) {
        let inner = c["name"].trim();
        let end = c.get(0)?.end();
        // `[402번 노선]` names route 402, like the unbracketed form.
        if let Some((name, _)) = route_header(inner) {
            return Some((name, end));
        }
        if !is_generic_title(inner) && !RE_ARROW.is_match(inner) {
            return Some((collapse_ws(inner), end));
        }
        return None;
    }
    if let Some(c) = RE_ROUTE_TITLE.captures(line) {
        let name = collapse_ws(&c["name"]);
        if !is_generic_title(&name) {
            return Some((name, c.get(0)?.end()));
        }
    }
    None
}

// ── Stop tokens ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopOrder {
    Chain,
    Numbered(u32),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
struct FoundStop {
    name: String,
    hint: Option<String>,
    order: StopOrder,
    /// Byte span within the scanned text.
    span: (usize, usize),
}

fn is_stop_token(name: &str) -> bool {
    let len = name.chars().count();
    (2..=30).contains(&len)
        && name.chars().any(|c| c.is_alphabetic())
        && !SCHEDULE_WORDS.iter().any(|w| name.contains(w))
        && !FALSE_STATION_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Split off a parenthesised hint, drop labels and trailing times, and check
/// what is left looks like a stop name.
fn clean_token(raw: &str) -> Option<(String, Option<String>)> {
    let (head, hint) = match raw.find(['(', '（']) {
        Some(open) => {
            let inner = &raw[open..];
            let inner = inner
                .trim_start_matches(['(', '（'])
                .split([')', '）'])
                .next()
                .unwrap_or("")
                .trim();
            let hint = (!inner.is_empty() && !RE_TIME_ONLY.is_match(inner)).then(|| collapse_ws(inner));
            (&raw[..open], hint)
        }
        None => (raw, None),
    };

    let head = RE_TRAILING_TIME.replace(head, "");
    let head = head.rsplit([':', '：']).next().unwrap_or("");
    let name = collapse_ws(head);
    let name = name
        .trim_matches(|c: char| c.is_whitespace() || "-*•·,./~".contains(c))
        .to_string();

    is_stop_token(&name).then_some((name, hint))
}

fn locate(text: &str, start: usize, end: usize, name: &str) -> (usize, usize) {
    match text[start..end].find(name) {
        Some(offset) => (start + offset, start + offset + name.len()),
        None => (start, end),
    }
}

fn chain_stops(text: &str) -> Vec<FoundStop> {
    let mut segments = Vec::new();
    let mut start = 0;
    for m in RE_ARROW.find_iter(text) {
        segments.push((start, m.start()));
        start = m.end();
    }
    if segments.is_empty() {
        return Vec::new();
    }
    segments.push((start, text.len()));

    segments
        .into_iter()
        .filter_map(|(s, e)| {
            clean_token(&text[s..e]).map(|(name, hint)| FoundStop {
                span: locate(text, s, e, &name),
                name,
                hint,
                order: StopOrder::Chain,
            })
        })
        .collect()
}

fn numbered_stop(text: &str) -> Option<FoundStop> {
    let caps = RE_NUMBERED_STOP.captures(text)?;
    let seq = if let Some(n) = caps.name("num") {
        n.as_str().parse::<u32>().ok()?.saturating_sub(1)
    } else {
        let c = caps.name("circled")?.as_str().chars().next()?;
        c as u32 - '①' as u32
    };
    let rest = caps.name("rest")?;
    let (name, hint) = clean_token(rest.as_str())?;
    Some(FoundStop {
        span: locate(text, rest.start(), rest.end(), &name),
        name,
        hint,
        order: StopOrder::Numbered(seq),
    })
}

fn keyword_stops(text: &str) -> Vec<FoundStop> {
    if CONTACT_WORDS.iter().any(|w| text.contains(w)) {
        return Vec::new();
    }
    RE_STOP_KEYWORD
        .captures_iter(text)
        .filter_map(|caps| {
            let m = caps.name("name")?;
            let name = collapse_ws(m.as_str());
            if !is_stop_token(&name) {
                return None;
            }
            let hint = caps
                .name("hint")
                .map(|h| collapse_ws(h.as_str()))
                .filter(|h| !h.is_empty() && !RE_TIME_ONLY.is_match(h));
            Some(FoundStop {
                name,
                hint,
                order: StopOrder::Unknown,
                span: (m.start(), m.end()),
            })
        })
        .collect()
}

fn stops_in_line(text: &str) -> Vec<FoundStop> {
    let chain = chain_stops(text);
    if chain.len() >= 2 {
        return chain;
    }
    if let Some(stop) = numbered_stop(text) {
        return vec![stop];
    }
    keyword_stops(text)
}

// ── Notes ────────────────────────────────────────────────────────────────────

/// Operating hours as `HH:MM~HH:MM`.
pub fn extract_hours(line: &str) -> Option<String> {
    let c = RE_TIME_RANGE.captures(line)?;
    Some(format!(
        "{:0>2}:{}~{:0>2}:{}",
        &c[1],
        c.get(2).map_or("00", |m| m.as_str()),
        &c[3],
        c.get(4).map_or("00", |m| m.as_str())
    ))
}

/// Headway such as `20분` or `15~20분`, only on lines that talk about it.
pub fn extract_interval(line: &str) -> Option<String> {
    if !(line.contains("간격") || line.contains("배차")) {
        return None;
    }
    let c = RE_INTERVAL.captures(line)?;
    Some(match c.get(2) {
        Some(max) => format!("{}~{}분", &c[1], max.as_str()),
        None => format!("{}분", &c[1]),
    })
}

#[derive(Debug, Default)]
struct Block {
    authority: String,
    route_name: Option<String>,
    next_chain_seq: u32,
    hours: Option<String>,
    interval: Option<String>,
}

impl Block {
    fn unnamed(authority: &str) -> Self {
        Self {
            authority: authority.to_string(),
            ..Self::default()
        }
    }

    fn named(authority: &str, name: String) -> Self {
        Self {
            route_name: Some(name),
            ..Self::unnamed(authority)
        }
    }

    fn capture_notes(&mut self, line: &str) {
        if self.hours.is_none() {
            self.hours = extract_hours(line);
        }
        if self.interval.is_none() {
            self.interval = extract_interval(line);
        }
    }

    fn into_note(self) -> Option<RouteNote> {
        (self.hours.is_some() || self.interval.is_some()).then_some(RouteNote {
            authority: Some(self.authority),
            route_name: self.route_name,
            hours: self.hours,
            interval: self.interval,
        })
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

/// Segment one extracted text into candidate stops.
pub fn structure(text: &ExtractedText, districts: &DistrictMap) -> Result<StructuredDocument, StructuringError> {
    let mut block = Block::unnamed(&text.authority);
    let mut notes = Vec::new();
    let mut candidates = Vec::new();
    let mut line_count = 0;

    for (idx, line) in text.text.lines().enumerate() {
        line_count += 1;
        let mut body_start = 0;
        if let Some((authority, end)) = district_header(line, districts) {
            debug!("{}: district section '{}' at line {}", text.source_url, authority, idx + 1);
            notes.extend(std::mem::replace(&mut block, Block::unnamed(authority)).into_note());
            body_start = end;
        }
        if let Some((name, end)) = route_header(&line[body_start..]) {
            debug!("{}: route block '{}' at line {}", text.source_url, name, idx + 1);
            let authority = block.authority.clone();
            notes.extend(std::mem::replace(&mut block, Block::named(&authority, name)).into_note());
            body_start += end;
        }
        block.capture_notes(line);

        for found in stops_in_line(&line[body_start..]) {
            let seq = match found.order {
                StopOrder::Chain => {
                    let s = block.next_chain_seq;
                    block.next_chain_seq += 1;
                    Some(s)
                }
                StopOrder::Numbered(n) => Some(n),
                StopOrder::Unknown => None,
            };
            candidates.push(CandidateStop {
                authority: block.authority.clone(),
                route_name: block.route_name.clone(),
                stop_name: found.name,
                seq,
                address_hint: found.hint,
                position: candidates.len(),
                provenance: Provenance {
                    document_hash: text.document_hash.clone(),
                    source_url: text.source_url.clone(),
                    line: idx + 1,
                    span: (body_start + found.span.0, body_start + found.span.1),
                },
                low_confidence: text.low_confidence,
            });
        }
    }
    notes.extend(block.into_note());

    if candidates.is_empty() {
        return Err(StructuringError::NoPatternMatch { lines: line_count });
    }

    debug!(
        "{}: {} candidates, {} notes",
        text.source_url,
        candidates.len(),
        notes.len()
    );
    Ok(StructuredDocument {
        authority: text.authority.clone(),
        document_hash: text.document_hash.clone(),
        candidates,
        notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtractionMethod;

    fn text(body: &str) -> ExtractedText {
        ExtractedText {
            authority: "yongsan".into(),
            source_url: "https://www.yongsan.go.kr/n/1".into(),
            document_hash: "abc".into(),
            method: ExtractionMethod::Html,
            text: body.into(),
            confidence: None,
            low_confidence: false,
            engine: None,
        }
    }

    fn parse(body: &str) -> Result<StructuredDocument, StructuringError> {
        structure(&text(body), &DistrictMap::seoul())
    }

    fn names(doc: &StructuredDocument) -> Vec<&str> {
        doc.candidates.iter().map(|c| c.stop_name.as_str()).collect()
    }

    #[test]
    fn arrow_chain_under_numbered_route() {
        let doc = parse("402번 노선: 시청역 → 서울역 → 용산역").unwrap();
        assert_eq!(names(&doc), vec!["시청역", "서울역", "용산역"]);
        let seqs: Vec<_> = doc.candidates.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);
        assert!(doc
            .candidates
            .iter()
            .all(|c| c.route_name.as_deref() == Some("402")));
        let first = &doc.candidates[0].provenance;
        assert_eq!(first.line, 1);
        let line = "402번 노선: 시청역 → 서울역 → 용산역";
        assert_eq!(&line[first.span.0..first.span.1], "시청역");
    }

    #[test]
    fn numbered_lines_give_explicit_seq() {
        let doc = parse("1호차\n1. 시청역 (중구 세종대로 110)\n② 서울역\n3) 용산역 08:30").unwrap();
        assert_eq!(names(&doc), vec!["시청역", "서울역", "용산역"]);
        let seqs: Vec<_> = doc.candidates.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(doc.candidates[0].address_hint.as_deref(), Some("중구 세종대로 110"));
        assert_eq!(doc.candidates[0].route_name.as_deref(), Some("1호차"));
    }

    #[test]
    fn keyword_stops_have_unknown_seq() {
        let doc = parse("[남산 순환]\n정차: 용산구청 앞, 이태원역 2번 출구, 한남오거리").unwrap();
        assert_eq!(names(&doc), vec!["용산구청 앞", "이태원역 2번 출구", "한남오거리"]);
        assert!(doc.candidates.iter().all(|c| c.seq.is_none()));
        assert_eq!(doc.candidates[0].route_name.as_deref(), Some("남산 순환"));
    }

    #[test]
    fn text_before_first_header_is_unnamed() {
        let doc = parse("출발: 시청역 → 서울역\n노선 3\n강남역 → 역삼역").unwrap();
        assert_eq!(doc.candidates[0].route_name, None);
        assert_eq!(doc.candidates[2].route_name.as_deref(), Some("3"));
        assert_eq!(doc.candidates[2].seq, Some(0));
    }

    #[test]
    fn schedule_and_contact_lines_are_ignored() {
        let doc = parse(
            "A코스\n운행시간 09:00~18:00 (20분 간격)\n시청역 → 서울역\n문의: 용산구청 교통행정과",
        )
        .unwrap();
        assert_eq!(names(&doc), vec!["시청역", "서울역"]);
        assert_eq!(
            doc.notes,
            vec![RouteNote {
                authority: Some("yongsan".into()),
                route_name: Some("A코스".into()),
                hours: Some("09:00~18:00".into()),
                interval: Some("20분".into()),
            }]
        );
    }

    #[test]
    fn hours_and_interval_formats() {
        assert_eq!(extract_hours("9시~18시 운행").as_deref(), Some("09:00~18:00"));
        assert_eq!(extract_hours("07:30 - 21:00").as_deref(), Some("07:30~21:00"));
        assert_eq!(extract_interval("배차 15~20분").as_deref(), Some("15~20분"));
        assert_eq!(extract_interval("도보 5분"), None);
    }

    #[test]
    fn generic_titles_are_not_route_headers() {
        assert!(route_header("무료 셔틀버스:").is_none());
        assert!(route_header("[운행 안내]").is_none());
        assert_eq!(route_header("[402번 노선]").map(|(n, _)| n), Some("402".to_string()));
        assert_eq!(route_header("남산순환셔틀:").map(|(n, _)| n), Some("남산순환셔틀".to_string()));
    }

    #[test]
    fn district_sections_attribute_stops_to_their_district() {
        let districts = DistrictMap::seoul().with_authority("용산구", "yongsan");
        let doc = structure(
            &text(concat!(
                "서울시 무료 셔틀버스 운행 안내\n",
                "■ 용산구\n",
                "1호차: 용산역 → 녹사평역 → 이태원역\n",
                "운행시간 09:00~18:00\n",
                "[강남구] 1호차: 강남역 → 역삼역 → 선릉역\n",
                "배차 20분 간격\n",
            )),
            &districts,
        )
        .unwrap();

        let by_stop: Vec<(&str, &str, Option<&str>)> = doc
            .candidates
            .iter()
            .map(|c| (c.stop_name.as_str(), c.authority.as_str(), c.route_name.as_deref()))
            .collect();
        assert_eq!(
            by_stop,
            vec![
                ("용산역", "yongsan", Some("1호차")),
                ("녹사평역", "yongsan", Some("1호차")),
                ("이태원역", "yongsan", Some("1호차")),
                ("강남역", "강남구", Some("1호차")),
                ("역삼역", "강남구", Some("1호차")),
                ("선릉역", "강남구", Some("1호차")),
            ]
        );
        // Sequence restarts in the new section.
        assert_eq!(doc.candidates[3].seq, Some(0));
        assert_eq!(doc.authority, "yongsan");

        let notes: Vec<_> = doc
            .notes
            .iter()
            .map(|n| (n.authority.as_deref(), n.hours.as_deref(), n.interval.as_deref()))
            .collect();
        assert_eq!(
            notes,
            vec![
                (Some("yongsan"), Some("09:00~18:00"), None),
                (Some("강남구"), None, Some("20분")),
            ]
        );
    }

    #[test]
    fn district_names_inside_stop_names_are_not_sections() {
        let districts = DistrictMap::seoul();
        assert!(district_header("용산구청 앞 → 이태원역", &districts).is_none());
        assert!(district_header("사업지구 안내", &districts).is_none());
        assert_eq!(
            district_header("서울특별시 중구: 시청역", &districts).map(|(a, _)| a),
            Some("중구")
        );
        assert!(district_header("■ 용산구", &DistrictMap::new()).is_none());
    }

    #[test]
    fn no_candidates_is_an_error() {
        let err = parse("운행 안내\n문의 02-123-4567").unwrap_err();
        assert_eq!(err, StructuringError::NoPatternMatch { lines: 2 });
    }

    #[test]
    fn low_confidence_is_inherited() {
        let mut t = text("시청역 → 서울역");
        t.low_confidence = true;
        let doc = structure(&t, &DistrictMap::seoul()).unwrap();
        assert!(doc.candidates.iter().all(|c| c.low_confidence));
    }
}
