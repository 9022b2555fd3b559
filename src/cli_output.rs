//! Text scraping for the inference CLI.
//!
//! The CLI prints human-oriented tables with emoji markers and colors, and
//! the exact layout moves between releases. Everything that depends on that
//! layout lives here. Every function is total: unrecognized input yields an
//! empty result.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
        .expect("valid ansi regex")
});

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid percent regex"));

const URL_PHRASES: &[&str] = &[
    "service is started on",
    "service is running on",
    "already running on",
];

const STATUS_SUFFIX: &str = "/openai/status";

const ALIAS_COLUMN: &str = "Alias";
const SIBLING_COLUMNS: &[&str] = &["Device", "Task", "File Size", "License", "Model ID"];

const CACHE_MARKER: char = '💾';

const RUNNING_SECTION: &str = "models running in service";
const NOTHING_LOADED: &[&str] = &["no models are currently loaded", "no models loaded"];

/// A row of the "running in service" report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningModel {
    pub alias: String,
    /// Service-assigned id when the report carries one next to the alias.
    pub model_id: Option<String>,
}

/// Remove terminal escape sequences (colors, cursor movement, titles).
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Find the service base URL in `service status` / `service start` output.
///
/// `"Service is Started on http://127.0.0.1:52356/, PID 3728!"` gives
/// `http://127.0.0.1:52356`.
pub fn parse_service_url(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let mut hits: Vec<usize> = URL_PHRASES
        .iter()
        .flat_map(|p| lower.match_indices(p).map(move |(i, _)| i + p.len()))
        .collect();
    hits.sort_unstable();

    hits.into_iter()
        .find_map(|after| extract_url(&text[after..]))
}

fn extract_url(rest: &str) -> Option<String> {
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '`' || c == '"' || c == '\'');
    if !rest.to_ascii_lowercase().starts_with("http") {
        return None;
    }
    let token: &str = rest
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '`' | '"' | '\'' | '!'))
        .next()?;
    let token = token.strip_suffix(STATUS_SUFFIX).unwrap_or(token);

    let scheme_end = token.find("://")? + 3;
    let host_end = token[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(token.len());
    if host_end == scheme_end {
        return None;
    }
    let base = token[..host_end].trim_end_matches('.');
    if base.len() <= scheme_end {
        return None;
    }
    Some(base.to_string())
}

fn is_hint_line(trimmed: &str) -> bool {
    trimmed.starts_with("To ") || trimmed.starts_with("Use ")
}

fn is_divider_line(trimmed: &str) -> bool {
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| matches!(c, '-' | '─' | '=' | '+' | '|' | ' '))
}

fn is_identifier(token: &str) -> bool {
    !token.is_empty()
        && token.chars().any(|c| c.is_ascii_alphanumeric())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn is_model_id(token: &str) -> bool {
    is_identifier(token.trim_end_matches(|c: char| c == ':' || c.is_ascii_digit()))
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, token: &str) {
    if seen.insert(token.to_ascii_lowercase()) {
        out.push(token.to_string());
    }
}

/// Character span of the Alias column, derived from a table header line.
fn alias_column_span(line: &str) -> Option<(usize, usize)> {
    let alias_byte = line.find(ALIAS_COLUMN)?;
    let after = alias_byte + ALIAS_COLUMN.len();
    let next_byte = SIBLING_COLUMNS
        .iter()
        .filter_map(|col| line[after..].find(col).map(|i| after + i))
        .min()?;
    let start = line[..alias_byte].chars().count();
    let end = line[..next_byte].chars().count();
    Some((start, end))
}

/// Aliases from the `model list` table, read from the Alias column span.
///
/// Column slicing matters: a row whose alias cell is blank (a second device
/// variant of the previous model) must not pick up the Device column.
pub fn parse_available_aliases(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut span: Option<(usize, usize)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(s) = alias_column_span(line) {
            span = Some(s);
            continue;
        }
        let Some((start, end)) = span else {
            continue;
        };
        if trimmed.is_empty() || is_divider_line(trimmed) {
            continue;
        }
        if is_hint_line(trimmed) {
            span = None;
            continue;
        }

        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= start {
            continue;
        }
        let cell: String = chars[start..end.min(chars.len())].iter().collect();
        let Some(token) = cell.split_whitespace().next() else {
            continue;
        };
        if token.eq_ignore_ascii_case(ALIAS_COLUMN) || !is_identifier(token) {
            continue;
        }
        push_unique(&mut out, &mut seen, token);
    }
    out
}

/// Aliases marked with the cache glyph in `cache list` output.
pub fn parse_cached_aliases(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for line in text.lines() {
        let Some(pos) = line.find(CACHE_MARKER) else {
            continue;
        };
        let rest = &line[pos + CACHE_MARKER.len_utf8()..];
        // Some terminals render the glyph with a variation selector.
        let rest = rest.trim_start_matches('\u{fe0f}');
        if let Some(token) = rest.split_whitespace().next() {
            if is_identifier(token) {
                push_unique(&mut out, &mut seen, token);
            }
        }
    }
    out
}

/// Rows of the `service ps` report.
pub fn parse_running_models(text: &str) -> Vec<RunningModel> {
    let lower = text.to_ascii_lowercase();
    if NOTHING_LOADED.iter().any(|p| lower.contains(p)) {
        return Vec::new();
    }

    let mut out: Vec<RunningModel> = Vec::new();
    let mut seen = HashSet::new();
    let mut in_section = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if !in_section {
            in_section = trimmed.to_ascii_lowercase().contains(RUNNING_SECTION);
            continue;
        }
        if is_hint_line(trimmed) {
            break;
        }
        if trimmed.is_empty() || is_divider_line(trimmed) {
            continue;
        }

        let tokens: Vec<&str> = trimmed
            .split_whitespace()
            .filter(|t| !t.to_ascii_lowercase().starts_with("http"))
            .collect();
        let Some(&alias) = tokens.iter().find(|t| is_identifier(t)) else {
            continue;
        };
        if alias.eq_ignore_ascii_case(ALIAS_COLUMN) {
            continue;
        }
        if !seen.insert(alias.to_ascii_lowercase()) {
            continue;
        }
        let model_id = tokens
            .last()
            .filter(|id| is_model_id(id) && !id.eq_ignore_ascii_case(alias))
            .map(|id| id.to_string());
        out.push(RunningModel {
            alias: alias.to_string(),
            model_id,
        });
    }
    out
}

/// Aliases currently loaded in the service.
pub fn parse_loaded_aliases(text: &str) -> Vec<String> {
    parse_running_models(text)
        .into_iter()
        .map(|m| m.alias)
        .collect()
}

/// Percent complete from one progress line (`"Downloading  42.5% ..."` gives 42).
pub fn parse_percent(line: &str) -> Option<u8> {
    let caps = PERCENT_RE.captures_iter(line).last()?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(value.floor().clamp(0.0, 100.0) as u8)
}
