//! Ordered fallback chains.
//!
//! A chain is a fixed list of attempts. The first success wins; when every
//! attempt fails the caller gets one error listing each failure in order.
//! There is no retry of an individual attempt.

use crate::{Result, error::SourceGateError};
use std::future::Future;

/// One named attempt in a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy<T> {
    /// Short label used in the combined error
    pub name: String,
    /// Input handed to the attempt, usually a SQL statement
    pub input: T,
}

impl<T> Strategy<T> {
    /// Creates a named strategy.
    pub fn new(name: impl Into<String>, input: T) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// Runs `attempt` over `strategies` in order and returns the first success.
///
/// # Errors
/// Returns the single error unchanged when only one strategy ran, otherwise
/// a `Query` error naming every failed strategy. An empty chain is a
/// `Configuration` error.
pub async fn first_success<T, R, F, Fut>(strategies: Vec<Strategy<T>>, mut attempt: F) -> Result<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    if strategies.is_empty() {
        return Err(SourceGateError::configuration(
            "no strategy available for this backend",
        ));
    }

    let total = strategies.len();
    let mut failures = Vec::with_capacity(total);

    for strategy in strategies {
        match attempt(strategy.input).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_query_safety() => return Err(e),
            Err(e) => {
                tracing::debug!(strategy = %strategy.name, "Strategy failed: {}", e);
                failures.push((strategy.name, e));
            }
        }
    }

    if total == 1
        && let Some((_, error)) = failures.pop()
    {
        return Err(error);
    }

    let summary = failures
        .iter()
        .map(|(name, error)| format!("{name}: {error}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(SourceGateError::query(format!(
        "all {total} strategies failed ({summary})"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let calls = Cell::new(0);
        let strategies = vec![
            Strategy::new("first", 1),
            Strategy::new("second", 2),
            Strategy::new("third", 3),
        ];
        let result = first_success(strategies, |n| {
            calls.set(calls.get() + 1);
            async move {
                if n == 2 {
                    Ok(n * 10)
                } else {
                    Err(SourceGateError::query(format!("attempt {n} failed")))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 20);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_all_failures_are_reported_in_order() {
        let strategies = vec![Strategy::new("information_schema", ()), Strategy::new("native", ())];
        let err = first_success(strategies, |()| async {
            Err::<(), _>(SourceGateError::query("no such table"))
        })
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("all 2 strategies failed"));
        let first = message.find("information_schema").unwrap();
        let second = message.find("native").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_single_strategy_error_passes_through() {
        let err = first_success(vec![Strategy::new("only", ())], |()| async {
            Err::<(), _>(SourceGateError::not_found("table 'x'"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SourceGateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_chain_is_configuration_error() {
        let err = first_success(Vec::<Strategy<()>>::new(), |()| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SourceGateError::Configuration { .. }));
    }
}
