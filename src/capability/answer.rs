//! Deterministic cleanup of model answers before they reach the core.
//!
//! Even when asked for bare JSON, models wrap answers in ```` ```json ````
//! fences, use CRLF line endings, prepend a sentence of commentary or leak
//! zero-width characters. The rules below fix those quirks without touching
//! content; [`parse_json_answer`] then deserializes the result.
//!
//! Rules (applied in order):
//! 1. Normalise line endings (CRLF → LF)
//! 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 3. Strip outer code fences
//! 4. Trim

use crate::error::CapabilityError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

/// Apply all cleanup rules to a raw answer.
pub fn clean_answer(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = strip_code_fences(&s);
    s.trim().to_string()
}

/// Clean an answer and deserialize it as JSON.
///
/// When the cleaned text is not JSON on its own, the outermost `{…}` or
/// `[…]` span is tried before giving up.
pub fn parse_json_answer<T: DeserializeOwned>(raw: &str) -> Result<T, CapabilityError> {
    let cleaned = clean_answer(raw);
    if cleaned.is_empty() {
        return Err(CapabilityError::EmptyAnswer);
    }

    let first_err = match serde_json::from_str::<T>(&cleaned) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    if let Some(span) = embedded_json_span(&cleaned) {
        if let Ok(v) = serde_json::from_str::<T>(span) {
            return Ok(v);
        }
    }

    Err(CapabilityError::Unparsable {
        detail: format!("{first_err}: {}", preview(&cleaned)),
    })
}

/// Normalise one image description for templating.
///
/// Trims, drops surrounding quotes and a trailing period. Returns `None`
/// when nothing is left.
pub fn clean_description(raw: &str) -> Option<String> {
    let s = clean_answer(raw);
    let s = s.trim_matches(|c: char| c == '"' || c == '\'').trim();
    let s = s.trim_end_matches('.').trim_end();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip invisible Unicode ──────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*?)\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn embedded_json_span(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let close = if s[start..].starts_with('{') { '}' } else { ']' };
    let end = s.rfind(close)?;
    (end > start).then(|| &s[start..=end])
}

fn preview(s: &str) -> String {
    let p: String = s.chars().take(120).collect();
    if p.len() < s.len() {
        format!("{p}…")
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        schema: String,
    }

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"schema\": \"rag1\"}\n```";
        assert_eq!(clean_answer(raw), "{\"schema\": \"rag1\"}");
    }

    #[test]
    fn strips_bare_fence_and_crlf() {
        let raw = "```\r\n[1, 2]\r\n```\r\n";
        assert_eq!(clean_answer(raw), "[1, 2]");
    }

    #[test]
    fn removes_zero_width() {
        assert_eq!(clean_answer("\u{FEFF}ok\u{200B}"), "ok");
    }

    #[test]
    fn parses_fenced_json() {
        let v: Verdict = parse_json_answer("```json\n{\"schema\":\"rag2\"}\n```").unwrap();
        assert_eq!(v.schema, "rag2");
    }

    #[test]
    fn parses_json_after_commentary() {
        let v: Verdict =
            parse_json_answer("Here is my answer: {\"schema\":\"rag1\"} Hope it helps.").unwrap();
        assert_eq!(v.schema, "rag1");
    }

    #[test]
    fn empty_answer_is_distinct() {
        let err = parse_json_answer::<Verdict>("   \n").unwrap_err();
        assert_eq!(err, CapabilityError::EmptyAnswer);
    }

    #[test]
    fn prose_is_unparsable() {
        let err = parse_json_answer::<Verdict>("I think it is rag1").unwrap_err();
        assert!(matches!(err, CapabilityError::Unparsable { .. }));
    }

    #[test]
    fn description_cleanup() {
        assert_eq!(clean_description("  A red valve. ").as_deref(), Some("A red valve"));
        assert_eq!(clean_description("\"B\"").as_deref(), Some("B"));
        assert_eq!(clean_description(" . "), None);
        assert_eq!(clean_description(""), None);
    }
}
