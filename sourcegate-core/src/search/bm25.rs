//! BM25 ranking of item names against a tokenized query.

use super::tokenize;
use std::collections::{HashMap, HashSet};

/// Term-frequency saturation.
pub const K1: f64 = 1.5;

/// Document-length normalization.
pub const B: f64 = 0.75;

/// Scores every item against `pattern`.
///
/// The returned vector is parallel to `items`. Items sharing no token with
/// the pattern score exactly 0; an empty tokenized pattern scores every item 0.
pub fn scores<S: AsRef<str>>(items: &[S], pattern: &str) -> Vec<f64> {
    let query: Vec<String> = {
        let mut seen = HashSet::new();
        tokenize(pattern)
            .into_iter()
            .filter(|term| seen.insert(term.clone()))
            .collect()
    };

    let documents: Vec<Vec<String>> = items.iter().map(|item| tokenize(item.as_ref())).collect();
    if query.is_empty() || documents.is_empty() {
        return vec![0.0; items.len()];
    }

    let count = documents.len() as f64;
    let total_length: usize = documents.iter().map(Vec::len).sum();
    let average_length = (total_length as f64 / count).max(1.0);

    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for document in &documents {
        let unique: HashSet<&str> = document.iter().map(String::as_str).collect();
        for term in unique {
            *document_frequency.entry(term).or_default() += 1;
        }
    }

    documents
        .iter()
        .map(|document| {
            let length = document.len() as f64;
            query
                .iter()
                .map(|term| {
                    let frequency = document.iter().filter(|token| *token == term).count();
                    if frequency == 0 {
                        return 0.0;
                    }
                    let df = document_frequency.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let idf = ((count - df + 0.5) / (df + 0.5)).ln_1p();
                    let tf = frequency as f64;
                    idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * length / average_length))
                })
                .sum()
        })
        .collect()
}
