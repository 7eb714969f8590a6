//! Pagination over document sections and result chunks.
//!
//! Callers address a unit either by percentile (`0 <= p < 1`) or by 1-based
//! ordinal (`p >= 1`). Indices are clamped into range, so every request on a
//! non-empty set resolves to a real unit.

use crate::models::Page;

/// Resolves `p` to a 0-based unit index.
///
/// Returns `None` when `total_units` is 0. Negative and NaN values address
/// the first unit.
///
/// ```rust
/// use sourcegate_core::pagination::resolve_unit;
///
/// assert_eq!(resolve_unit(0.5, 10), Some(5));   // "Section 6 of 10"
/// assert_eq!(resolve_unit(15.0, 10), Some(9));  // clamped
/// assert_eq!(resolve_unit(0.3, 0), None);
/// ```
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resolve_unit(p: f64, total_units: usize) -> Option<usize> {
    if total_units == 0 {
        return None;
    }
    let last = total_units - 1;

    if p.is_nan() || p < 0.0 {
        return Some(0);
    }

    let index = if p < 1.0 {
        (p * total_units as f64).floor() as usize
    } else {
        // Float-to-int casts saturate, so huge values clamp to the last unit
        (p.floor() as usize).saturating_sub(1)
    };

    Some(index.min(last))
}

/// Splits `text` into units of at most `unit_chars` characters.
///
/// Units end on the last line break inside the window when there is one,
/// so sections rarely cut a line in half. Empty text yields no units.
pub fn split_units(text: &str, unit_chars: usize) -> Vec<String> {
    let unit_chars = unit_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut units = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let hard_end = (start + unit_chars).min(chars.len());
        let end = if hard_end < chars.len() {
            chars[start..hard_end]
                .iter()
                .rposition(|c| *c == '\n')
                .map_or(hard_end, |offset| start + offset + 1)
        } else {
            hard_end
        };
        units.push(chars[start..end].iter().collect());
        start = end;
    }

    units
}

/// Picks one unit out of `units` using `p`.
///
/// Returns `None` for an empty unit list.
pub fn select_page(units: &[String], p: f64) -> Option<Page> {
    let index = resolve_unit(p, units.len())?;
    Some(Page {
        content: units[index].clone(),
        unit_index: index + 1,
        total_units: units.len(),
    })
}
