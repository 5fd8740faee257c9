//! Deterministic cleanup of OCR engine output.
//!
//! Vision models answer in loosely formatted Markdown even when asked for
//! plain text: outer code fences, `#` headings, GFM tables for timetable
//! grids, `**bold**` emphasis. The structurer works line by line on plain
//! text, so each of those is flattened here. Every rule is a pure
//! `&str → String` pass and runs in a fixed order: fences come off before
//! line endings are normalised, and table rows are flattened before blank
//! runs are collapsed.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to raw engine output.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Remove invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Flatten GFM table rows into space-separated cells, dropping separators
/// 5. Strip heading markers and emphasis
/// 6. Trim each line
/// 7. Collapse runs of blank lines to one
pub fn clean_ocr_text(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = flatten_tables(&s);
    let s = strip_markup(&s);
    let s = trim_lines(&s);
    collapse_blank_lines(&s)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode ─────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Flatten tables ───────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.ends_with('|') && t.len() > 1
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    is_table_row(t)
        && t.trim_matches('|')
            .split('|')
            .all(|cell| {
                let c = cell.trim();
                !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':')
            })
}

fn flatten_tables(input: &str) -> String {
    input
        .lines()
        .filter(|line| !is_separator_row(line))
        .map(|line| {
            if is_table_row(line) {
                line.trim()
                    .trim_matches('|')
                    .split('|')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Strip headings and emphasis ──────────────────────────────────────

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s+").unwrap());
static RE_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__)(.+?)(\*\*|__)").unwrap());

fn strip_markup(input: &str) -> String {
    let s = RE_HEADING.replace_all(input, "");
    RE_EMPHASIS.replace_all(&s, "$2").to_string()
}

// ── Rule 6: Trim lines ───────────────────────────────────────────────────────

fn trim_lines(input: &str) -> String {
    input.lines().map(str::trim).collect::<Vec<_>>().join("\n")
}

// ── Rule 7: Collapse blank runs ──────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES
        .replace_all(input.trim(), "\n\n")
        .to_string()
}

// ── Confidence estimate ──────────────────────────────────────────────────────

/// Text-quality estimate for engines that report no confidence.
///
/// The share of characters that plausibly belong in a Korean transit notice:
/// Hangul syllables and jamo, ASCII alphanumerics, whitespace and common
/// punctuation (including arrows and the `~` used in time ranges). Garbled
/// recognition produces stray symbols and drives the ratio down.
pub fn estimate_confidence(text: &str) -> f32 {
    let mut total = 0usize;
    let mut plausible = 0usize;
    for ch in text.chars() {
        total += 1;
        if is_plausible(ch) {
            plausible += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        plausible as f32 / total as f32
    }
}

fn is_plausible(ch: char) -> bool {
    matches!(ch,
        '\u{AC00}'..='\u{D7A3}'
        | '\u{1100}'..='\u{11FF}'
        | '\u{3130}'..='\u{318F}'
        | '\u{2460}'..='\u{2473}'
        | '\u{2190}'..='\u{21FF}'
        | '\u{27A1}'
    ) || ch.is_ascii_alphanumeric()
        || ch.is_whitespace()
        || ".,:;()[]-~/·→<>\"'!?%&+#".contains(ch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```text\n시청역\n```"), "시청역");
        assert_eq!(strip_code_fences("```\n시청역\n```"), "시청역");
        assert_eq!(strip_code_fences("시청역"), "시청역");
    }

    #[test]
    fn flattens_tables() {
        let input = "| 순번 | 정류장 |\n| --- | :---: |\n| 1 | 시청역 |\n| 2 | 서울역 |";
        assert_eq!(flatten_tables(input), "순번 정류장\n1 시청역\n2 서울역");
    }

    #[test]
    fn strips_headings_and_bold() {
        assert_eq!(strip_markup("## 402번 노선\n**시청역** → 서울역"), "402번 노선\n시청역 → 서울역");
    }

    #[test]
    fn removes_invisible() {
        assert_eq!(remove_invisible_chars("시청\u{200B}역\u{FEFF}"), "시청역");
    }

    #[test]
    fn full_cleanup() {
        let raw = "```markdown\r\n# 무료 셔틀\r\n\r\n\r\n\r\n402번 노선: 시청역 → 서울역   \r\n```";
        assert_eq!(clean_ocr_text(raw), "무료 셔틀\n\n402번 노선: 시청역 → 서울역");
    }

    #[test]
    fn confidence_of_clean_text_is_high() {
        assert!(estimate_confidence("402번 노선: 시청역 → 서울역 (09:00~18:00)") > 0.95);
    }

    #[test]
    fn confidence_of_garbage_is_low() {
        assert!(estimate_confidence("§¶¤¥©®¬¦¨¯°±²³") < 0.4);
        assert_eq!(estimate_confidence(""), 0.0);
    }
}
