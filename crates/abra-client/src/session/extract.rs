//! Token extraction from the origin's HTML.
//!
//! The page embeds its tokens inside large script bootstraps whose
//! surrounding markup shifts between deployments. Extraction therefore
//! runs as an ordered chain of strategies: exact substring markers first
//! (cheap, byte-faithful to the current page format), then looser
//! regexes that survive whitespace and ordering changes. The first
//! strategy to produce a token wins for that token.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::REQUIRED_TOKENS;

pub(crate) trait ExtractStrategy: Sync {
    fn name(&self) -> &'static str;
    fn try_extract(&self, body: &str) -> HashMap<String, String>;
}

pub(crate) static STRATEGIES: [&'static dyn ExtractStrategy; 2] = [&ExactMarkers, &LooseRegex];

/// Run the strategy chain over a page body, stopping early once every
/// required token has been found.
pub(crate) fn extract_tokens(body: &str) -> HashMap<String, String> {
    let mut tokens = HashMap::new();
    for strategy in STRATEGIES {
        let found = strategy.try_extract(body);
        if !found.is_empty() {
            debug!(
                strategy = strategy.name(),
                tokens = found.len(),
                "extracted page tokens"
            );
        }
        for (name, value) in found {
            tokens.entry(name).or_insert(value);
        }
        if REQUIRED_TOKENS.iter().all(|name| tokens.contains_key(*name)) {
            break;
        }
    }
    tokens
}

/// Every token name the session layer tracks, across the page markers
/// and the cookie-jar fallback.
pub(crate) const KNOWN_TOKENS: [&str; 6] =
    ["datr", "lsd", "abra_csrf", "_js_datr", "fb_dtsg", "rd_challenge"];

/// Tracked tokens a map lacks or holds empty, for the diagnostics log.
pub(crate) fn missing_tokens(tokens: &HashMap<String, String>) -> Vec<&'static str> {
    KNOWN_TOKENS
        .iter()
        .copied()
        .filter(|name| !tokens.get(*name).is_some_and(|value| !value.is_empty()))
        .collect()
}

// ---------------------------------------------------------------------------
// Exact markers
// ---------------------------------------------------------------------------

/// Byte-exact start/end markers as the page currently renders them.
///
/// The `datr` marker carries its leading quote; without it the search
/// would land inside `_js_datr`.
const MARKERS: [(&str, &str, &str); 5] = [
    ("_js_datr", "_js_datr\":{\"value\":\"", "\","),
    ("abra_csrf", "abra_csrf\":{\"value\":\"", "\","),
    ("datr", "\"datr\":{\"value\":\"", "\","),
    ("lsd", "\"LSD\",[],{\"token\":\"", "\"}"),
    ("fb_dtsg", "DTSGInitData\",[],{\"token\":\"", "\""),
];

pub(crate) struct ExactMarkers;

impl ExtractStrategy for ExactMarkers {
    fn name(&self) -> &'static str {
        "exact-markers"
    }

    fn try_extract(&self, body: &str) -> HashMap<String, String> {
        let mut found = HashMap::new();
        for (name, start, end) in MARKERS {
            if let Some(value) = extract_between(body, start, end) {
                found.insert(name.to_string(), value.to_string());
            }
        }
        found
    }
}

fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let len = text[from..].find(end)?;
    let value = &text[from..from + len];
    (!value.is_empty()).then_some(value)
}

// ---------------------------------------------------------------------------
// Loose regexes
// ---------------------------------------------------------------------------

static DATR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^_]datr"\s*:\s*\{\s*"value"\s*:\s*"([^"]+)""#).unwrap());
static JS_DATR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"_js_datr"\s*:\s*\{\s*"value"\s*:\s*"([^"]+)""#).unwrap());
static CSRF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"abra_csrf"\s*:\s*\{\s*"value"\s*:\s*"([^"]+)""#).unwrap());
static LSD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""LSD",\[\],\{"token":"([^"]+)"\}"#).unwrap());
static DTSG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"DTSGInitData",\[\],\{"token":"([^"]+)""#).unwrap());

pub(crate) struct LooseRegex;

impl ExtractStrategy for LooseRegex {
    fn name(&self) -> &'static str {
        "loose-regex"
    }

    fn try_extract(&self, body: &str) -> HashMap<String, String> {
        let patterns: [(&str, &Regex); 5] = [
            ("datr", &DATR_RE),
            ("_js_datr", &JS_DATR_RE),
            ("abra_csrf", &CSRF_RE),
            ("lsd", &LSD_RE),
            ("fb_dtsg", &DTSG_RE),
        ];
        let mut found = HashMap::new();
        for (name, pattern) in patterns {
            if let Some(captures) = pattern.captures(body) {
                found.insert(name.to_string(), captures[1].to_string());
            }
        }
        found
    }
}
