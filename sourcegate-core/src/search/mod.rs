//! Name search over tables, endpoints and documents.
//!
//! Three interchangeable algorithms share one contract: given the same items,
//! pattern, mode and limit they return the same ordered subset of items, at
//! most `limit` long, with ties kept in input order.

pub mod bm25;
pub mod jaro_winkler;

use crate::{Result, error::SourceGateError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[allow(clippy::expect_used)]
static TOKEN_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[/._\s-]+").expect("token separator pattern is valid"));

/// Search algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Case-insensitive regular expression match on the raw name
    Regex,
    /// BM25 ranking over tokenized names
    #[default]
    Bm25,
    /// Jaro-Winkler similarity of tokenized names
    JaroWinkler,
}

impl std::str::FromStr for SearchMode {
    type Err = SourceGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regex" => Ok(Self::Regex),
            "bm25" => Ok(Self::Bm25),
            "jaro_winkler" | "jaro-winkler" | "jarowinkler" => Ok(Self::JaroWinkler),
            other => Err(SourceGateError::search_mode(format!(
                "unknown search mode '{other}' (expected regex, bm25 or jaro_winkler)"
            ))),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regex => write!(f, "regex"),
            Self::Bm25 => write!(f, "bm25"),
            Self::JaroWinkler => write!(f, "jaro_winkler"),
        }
    }
}

/// A search call: pattern, algorithm and result cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Pattern or free-text query
    pub pattern: String,
    /// Algorithm
    #[serde(default)]
    pub mode: SearchMode,
    /// Maximum number of results
    pub limit: usize,
}

impl SearchRequest {
    /// Creates a request.
    pub fn new(pattern: impl Into<String>, mode: SearchMode, limit: usize) -> Self {
        Self {
            pattern: pattern.into(),
            mode,
            limit,
        }
    }

    /// Runs the request against `items`.
    ///
    /// # Errors
    /// Returns `SearchMode` for an invalid regular expression
    pub fn run<S: AsRef<str>>(&self, items: &[S]) -> Result<Vec<String>> {
        search(items, &self.pattern, self.mode, self.limit)
    }
}

/// Splits a name into lower-cased tokens on `/`, `.`, `_`, `-` and whitespace.
///
/// ```rust
/// use sourcegate_core::search::tokenize;
///
/// assert_eq!(tokenize("GET /users/{id}"), vec!["get", "users", "{id}"]);
/// assert_eq!(tokenize("sales.order_items"), vec!["sales", "order", "items"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_SPLIT
        .split(text)
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Searches `items` for `pattern` using `mode`, returning at most `limit`
/// names in ranked order.
///
/// # Errors
/// Returns `SearchMode` if `mode` is `Regex` and `pattern` does not compile
pub fn search<S: AsRef<str>>(
    items: &[S],
    pattern: &str,
    mode: SearchMode,
    limit: usize,
) -> Result<Vec<String>> {
    if limit == 0 || items.is_empty() {
        if mode == SearchMode::Regex {
            compile(pattern)?;
        }
        return Ok(Vec::new());
    }

    let results = match mode {
        SearchMode::Regex => regex_search(items, &compile(pattern)?, limit),
        SearchMode::Bm25 => rank(items, &bm25::scores(items, pattern), limit, true),
        SearchMode::JaroWinkler => rank(
            items,
            &jaro_winkler::similarities(items, pattern),
            limit,
            false,
        ),
    };

    tracing::trace!(mode = %mode, matched = results.len(), "Search completed");
    Ok(results)
}

fn compile(pattern: &str) -> Result<Regex> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| SourceGateError::search_mode(format!("invalid regex '{pattern}': {e}")))
}

fn regex_search<S: AsRef<str>>(items: &[S], regex: &Regex, limit: usize) -> Vec<String> {
    items
        .iter()
        .map(|item| item.as_ref())
        .filter(|name| regex.is_match(name))
        .take(limit)
        .map(str::to_string)
        .collect()
}

/// Orders items by descending score, keeping input order on ties.
fn rank<S: AsRef<str>>(
    items: &[S],
    scores: &[f64],
    limit: usize,
    drop_non_positive: bool,
) -> Vec<String> {
    let mut ranked: Vec<(usize, f64)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| !drop_non_positive || *score > 0.0)
        .collect();

    // sort_by is stable, so equal scores keep their input order
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    ranked
        .into_iter()
        .take(limit)
        .map(|(index, _)| items[index].as_ref().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLES: &[&str] = &[
        "public.users",
        "public.user_sessions",
        "sales.orders",
        "sales.order_items",
        "audit.login_events",
    ];

    #[test]
    fn test_tokenize_drops_empty_tokens() {
        assert_eq!(tokenize("  __a--b//c.. "), vec!["a", "b", "c"]);
        assert!(tokenize("/._-").is_empty());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("regex".parse::<SearchMode>().unwrap(), SearchMode::Regex);
        assert_eq!("BM25".parse::<SearchMode>().unwrap(), SearchMode::Bm25);
        assert_eq!(
            "jaro_winkler".parse::<SearchMode>().unwrap(),
            SearchMode::JaroWinkler
        );
        let err = "fuzzy".parse::<SearchMode>().unwrap_err();
        assert!(matches!(err, SourceGateError::SearchMode { .. }));
    }

    #[test]
    fn test_regex_keeps_input_order_and_limit() {
        let found = search(TABLES, "ORDER", SearchMode::Regex, 10).unwrap();
        assert_eq!(found, vec!["sales.orders", "sales.order_items"]);

        let found = search(TABLES, "user", SearchMode::Regex, 1).unwrap();
        assert_eq!(found, vec!["public.users"]);
    }

    #[test]
    fn test_invalid_regex_is_search_error() {
        let err = search(TABLES, "(unclosed", SearchMode::Regex, 5).unwrap_err();
        assert!(matches!(err, SourceGateError::SearchMode { .. }));
    }

    #[test]
    fn test_invalid_regex_is_reported_without_candidates() {
        let none: &[&str] = &[];
        for (items, limit) in [(none, 5), (TABLES, 0)] {
            let err = search(items, "(unclosed", SearchMode::Regex, limit).unwrap_err();
            assert!(matches!(err, SourceGateError::SearchMode { .. }));
        }
        assert!(search(none, "(unclosed", SearchMode::Bm25, 5).unwrap().is_empty());
    }

    #[test]
    fn test_zero_limit_returns_nothing() {
        for mode in [SearchMode::Regex, SearchMode::Bm25, SearchMode::JaroWinkler] {
            assert!(search(TABLES, "users", mode, 0).unwrap().is_empty());
        }
    }

    #[test]
    fn test_bm25_ranks_full_match_above_non_match() {
        let found = search(TABLES, "order items", SearchMode::Bm25, 10).unwrap();
        assert_eq!(found.first().map(String::as_str), Some("sales.order_items"));
        assert!(!found.contains(&"audit.login_events".to_string()));
    }

    #[test]
    fn test_bm25_empty_pattern_returns_nothing() {
        assert!(search(TABLES, " ._- ", SearchMode::Bm25, 10).unwrap().is_empty());
    }

    #[test]
    fn test_jaro_winkler_exact_match_first() {
        let found = search(TABLES, "Sales Orders", SearchMode::JaroWinkler, 3).unwrap();
        assert_eq!(found[0], "sales.orders");
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_search_request_runs_search() {
        let request = SearchRequest::new("login", SearchMode::Regex, 5);
        assert_eq!(request.run(TABLES).unwrap(), vec!["audit.login_events"]);
    }

    #[test]
    fn test_rank_is_stable_on_ties() {
        let items = ["a", "b", "c", "d"];
        let ranked = rank(&items, &[1.0, 2.0, 1.0, 2.0], 4, true);
        assert_eq!(ranked, vec!["b", "d", "a", "c"]);
    }
}
