//! Aggregation of independently settled outcomes.
//!
//! Teardown paths fire several unsubscribes at once and need one verdict
//! plus one diagnostic message, whichever subset of them failed.

use std::{fmt, future::Future};

use futures::future::{OptionFuture, join_all};

/// Outcome of one entry in a settled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation succeeded.
    Fulfilled(T),
    /// The operation failed with this message.
    Rejected(String),
    /// The caller declined this entry; counts as success.
    Skipped,
}

impl<T> Outcome<T> {
    /// Whether this entry failed.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// One failed entry of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Position of the entry in the original batch.
    pub index: usize,
    /// Error message of the entry.
    pub message: String,
}

/// Aggregated failure of a settled batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", format_failures(.failures))]
pub struct SettledError {
    /// Every failed entry, in batch order.
    pub failures: Vec<Failure>,
}

fn format_failures(failures: &[Failure]) -> String {
    failures.iter().fold(String::from("errors:"), |mut out, f| {
        out.push_str(&format!("\n[{}]: {}", f.index, f.message));
        out
    })
}

/// Results of a batch of operations that were all awaited to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledResults<T> {
    outcomes: Vec<Outcome<T>>,
}

impl<T> SettledResults<T> {
    /// Build from plain results.
    pub fn from_results<E, I>(results: I) -> Self
    where
        E: fmt::Display,
        I: IntoIterator<Item = Result<T, E>>,
    {
        Self::from_optional(results.into_iter().map(Some))
    }

    /// Build from results where `None` marks a skipped entry.
    pub fn from_optional<E, I>(results: I) -> Self
    where
        E: fmt::Display,
        I: IntoIterator<Item = Option<Result<T, E>>>,
    {
        let outcomes = results
            .into_iter()
            .map(|r| match r {
                Some(Ok(value)) => Outcome::Fulfilled(value),
                Some(Err(e)) => Outcome::Rejected(e.to_string()),
                None => Outcome::Skipped,
            })
            .collect();
        Self { outcomes }
    }

    /// All outcomes in batch order.
    #[must_use]
    pub fn outcomes(&self) -> &[Outcome<T>] {
        &self.outcomes
    }

    /// True if no entry was rejected.
    #[must_use]
    pub fn is_all_fulfilled(&self) -> bool {
        !self.outcomes.iter().any(Outcome::is_rejected)
    }

    /// Failed entries with their batch index.
    #[must_use]
    pub fn failures(&self) -> Vec<Failure> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, o)| match o {
                Outcome::Rejected(message) => Some(Failure {
                    index,
                    message: message.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Diagnostic summary of the failures, `None` when everything succeeded.
    #[must_use]
    pub fn format_errors(&self) -> Option<String> {
        self.error().map(|e| e.to_string())
    }

    /// The aggregated error, if any entry failed.
    #[must_use]
    pub fn error(&self) -> Option<SettledError> {
        if self.is_all_fulfilled() {
            None
        } else {
            Some(SettledError {
                failures: self.failures(),
            })
        }
    }

    /// Fulfilled values, or the aggregated error if any entry failed.
    ///
    /// # Errors
    /// Returns [`SettledError`] listing every rejected entry.
    pub fn into_result(self) -> Result<Vec<T>, SettledError> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        Ok(self
            .outcomes
            .into_iter()
            .filter_map(|o| match o {
                Outcome::Fulfilled(v) => Some(v),
                _ => None,
            })
            .collect())
    }
}

/// Await every future concurrently and collect all outcomes.
pub async fn settle_all<I, F, T, E>(futures: I) -> SettledResults<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    SettledResults::from_results(join_all(futures).await)
}

/// Like [`settle_all`], with `None` entries recorded as skipped.
pub async fn settle_optional<I, F, T, E>(futures: I) -> SettledResults<T>
where
    I: IntoIterator<Item = Option<F>>,
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let results = join_all(futures.into_iter().map(OptionFuture::from)).await;
    SettledResults::from_optional(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_fulfilled_has_no_errors() {
        let settled = SettledResults::from_results::<String, _>(vec![Ok(1), Ok(2)]);
        assert!(settled.is_all_fulfilled());
        assert!(settled.format_errors().is_none());
        assert_eq!(settled.into_result().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_skipped_counts_as_success() {
        let settled =
            SettledResults::from_optional::<String, _>(vec![None, Some(Ok(())), None]);
        assert!(settled.is_all_fulfilled());
        assert_eq!(settled.outcomes()[0], Outcome::Skipped);
    }

    #[test]
    fn test_failures_keep_batch_index() {
        let settled = SettledResults::from_optional(vec![
            Some(Ok(())),
            None,
            Some(Err("unsubscribe failed")),
        ]);
        let err = settled.into_result().unwrap_err();
        assert_eq!(
            err.failures,
            vec![Failure {
                index: 2,
                message: "unsubscribe failed".into()
            }]
        );
        assert_eq!(err.to_string(), "errors:\n[2]: unsubscribe failed");
    }

    #[test]
    fn test_summary_lists_every_failure() {
        let settled = SettledResults::<()>::from_results(vec![Err("a"), Ok(()), Err("b")]);
        assert_eq!(
            settled.format_errors().as_deref(),
            Some("errors:\n[0]: a\n[2]: b")
        );
    }

    #[tokio::test]
    async fn test_settle_optional_awaits_everything() {
        let futs = vec![
            Some(futures::future::ready(Ok::<_, String>(1))),
            None,
            Some(futures::future::ready(Err("boom".to_string()))),
        ];
        let settled = settle_optional(futs).await;
        assert_eq!(settled.outcomes()[0], Outcome::Fulfilled(1));
        assert_eq!(settled.outcomes()[1], Outcome::Skipped);
        assert!(settled.outcomes()[2].is_rejected());
    }
}
