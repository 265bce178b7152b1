//! Heuristic token estimator (C1).
//!
//! Deliberately not a BPE tokenizer: the coefficients below are an
//! approximation callers may rely on for monotonicity only (more
//! characters never yields fewer estimated tokens), not for cross-provider
//! equality.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn bracket_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[{}()\[\]<>]").unwrap())
}

fn short_word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(the|a|an|is|are|was|were|of|to|in|on|at|it)\b").unwrap())
}

/// Collapses runs of whitespace to a single space and trims the ends.
fn normalize(text: &str) -> String {
    whitespace_pattern().replace_all(text.trim(), " ").into_owned()
}

fn count_brackets(text: &str) -> usize {
    bracket_pattern().find_iter(text).count()
}

fn count_short_words(text: &str) -> usize {
    short_word_pattern().find_iter(&text.to_lowercase()).count()
}

/// Estimates the token count of a string.
///
/// `max(1, len(normalized)/4 + 0.3*brackets - 0.2*short_words)`, rounded to
/// the nearest integer, with a floor of one token for any non-empty input
/// (and for empty input, since the estimate is a minimum bound).
pub fn count(text: &str) -> u64 {
    let normalized = normalize(text);
    let len = normalized.chars().count() as f64;
    let brackets = count_brackets(&normalized) as f64;
    let short_words = count_short_words(&normalized) as f64;

    let estimate = len / 4.0 + 0.3 * brackets - 0.2 * short_words;
    estimate.max(1.0).round() as u64
}

/// Estimates the token count of a structured value by serializing it to
/// compact JSON and delegating to [`count`].
pub fn count_of(value: &Value) -> u64 {
    let compact = serde_json::to_string(value).unwrap_or_default();
    count(&compact)
}

/// Estimates the token count of a string-keyed map by serializing it to
/// compact JSON (sorted keys for determinism) and delegating to [`count`].
pub fn count_of_map(map: &BTreeMap<String, Value>) -> u64 {
    let compact = serde_json::to_string(map).unwrap_or_default();
    count(&compact)
}
