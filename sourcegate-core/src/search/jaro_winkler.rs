//! Jaro-Winkler similarity of tokenized names.

use super::tokenize;

/// Weight given to a shared prefix.
pub const PREFIX_SCALE: f64 = 0.1;

/// Longest prefix that earns a bonus.
pub const MAX_PREFIX: usize = 4;

/// Similarity of each item to `pattern`, parallel to `items`.
///
/// Both sides are compared as their space-joined token lists, so
/// `"Sales Orders"` and `"sales.orders"` are identical.
pub fn similarities<S: AsRef<str>>(items: &[S], pattern: &str) -> Vec<f64> {
    let query = tokenize(pattern).join(" ");
    items
        .iter()
        .map(|item| similarity(&query, &tokenize(item.as_ref()).join(" ")))
        .collect()
}

/// Jaro-Winkler similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let jaro = jaro(a, b);
    let prefix = a
        .chars()
        .zip(b.chars())
        .take(MAX_PREFIX)
        .take_while(|(x, y)| x == y)
        .count();
    (prefix as f64).mul_add(PREFIX_SCALE * (1.0 - jaro), jaro)
}

/// Jaro similarity in `[0, 1]`.
pub fn jaro(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let window = (a.len().max(b.len()) / 2).saturating_sub(1);
    let mut a_matched = vec![false; a.len()];
    let mut b_matched = vec![false; b.len()];
    let mut matches = 0usize;

    for (i, ca) in a.iter().enumerate() {
        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(b.len());
        for j in start..end {
            if !b_matched[j] && b[j] == *ca {
                a_matched[i] = true;
                b_matched[j] = true;
                matches += 1;
                break;
            }
        }
    }

    if matches == 0 {
        return 0.0;
    }

    let a_sequence = a.iter().zip(&a_matched).filter(|(_, m)| **m).map(|(c, _)| c);
    let b_sequence = b.iter().zip(&b_matched).filter(|(_, m)| **m).map(|(c, _)| c);
    let transpositions = a_sequence.zip(b_sequence).filter(|(x, y)| x != y).count() / 2;

    let m = matches as f64;
    (m / a.len() as f64 + m / b.len() as f64 + (m - transpositions as f64) / m) / 3.0
}
