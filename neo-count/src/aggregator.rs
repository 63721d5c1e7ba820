//! Concurrent fan-out of per-date lookups and best-effort summation.
//!
//! One task is spawned per requested date (duplicates included) and every
//! task reaches a terminal state before [`Aggregator::aggregate`] returns.
//! A date whose lookup fails, is cancelled or panics contributes nothing;
//! it never fails the aggregate.

use crate::metrics_defs::{AGGREGATE_DATES, AGGREGATE_DURATION, LOOKUPS};
use crate::source::{CountSource, LookupError};
use shared::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Terminal state of one per-date lookup task
#[derive(Debug)]
pub enum LookupOutcome {
    Success(u64),
    Failure(LookupError),
}

impl LookupOutcome {
    /// What this lookup adds to the total. Failures add zero.
    pub fn contribution(&self) -> u64 {
        match self {
            LookupOutcome::Success(count) => *count,
            LookupOutcome::Failure(_) => 0,
        }
    }

    fn metric_tag(&self) -> &'static str {
        match self {
            LookupOutcome::Success(_) => "success",
            LookupOutcome::Failure(LookupError::Cancelled) => "cancelled",
            LookupOutcome::Failure(_) => "failure",
        }
    }
}

impl From<Result<u64, LookupError>> for LookupOutcome {
    fn from(result: Result<u64, LookupError>) -> Self {
        match result {
            Ok(count) => LookupOutcome::Success(count),
            Err(e) => LookupOutcome::Failure(e),
        }
    }
}

/// Sums the successful outcomes.
pub fn total(outcomes: &[(String, LookupOutcome)]) -> u64 {
    outcomes
        .iter()
        .map(|(_, outcome)| outcome.contribution())
        .fold(0u64, u64::saturating_add)
}

#[derive(Clone)]
pub struct Aggregator {
    source: Arc<dyn CountSource>,
    /// Bounds the number of lookups in flight per request when set
    max_concurrency: Option<usize>,
}

impl Aggregator {
    pub fn new(source: Arc<dyn CountSource>) -> Self {
        Self {
            source,
            max_concurrency: None,
        }
    }

    /// Limits each request to `width` concurrent lookups. Every date still
    /// gets its own task; excess tasks wait for a permit.
    pub fn with_max_concurrency(mut self, width: usize) -> Self {
        self.max_concurrency = Some(width);
        self
    }

    /// Total element count over `dates`, counting only the lookups that succeeded.
    ///
    /// Cancelling `scope` makes outstanding lookups give up; whatever already
    /// completed is still summed.
    pub async fn aggregate(&self, dates: &[String], scope: &CancellationToken) -> u64 {
        let started = Instant::now();
        let outcomes = self.lookup_all(dates, scope).await;
        let total = total(&outcomes);

        histogram!(AGGREGATE_DATES).record(dates.len() as f64);
        histogram!(AGGREGATE_DURATION).record(started.elapsed().as_secs_f64());
        tracing::debug!(
            dates = dates.len(),
            succeeded = outcomes
                .iter()
                .filter(|(_, outcome)| matches!(outcome, LookupOutcome::Success(_)))
                .count(),
            total,
            "Aggregated element counts"
        );

        total
    }

    /// Runs one lookup per entry of `dates` and returns every outcome, in
    /// completion order.
    pub async fn lookup_all(
        &self,
        dates: &[String],
        scope: &CancellationToken,
    ) -> Vec<(String, LookupOutcome)> {
        let permits = self.max_concurrency.map(|width| Arc::new(Semaphore::new(width)));
        let mut join_set = JoinSet::new();
        // Needed to attribute a panicked task to its date
        let mut task_dates = HashMap::new();

        for date in dates {
            let source = self.source.clone();
            let permits = permits.clone();
            let scope = scope.clone();
            let task_date = date.clone();

            let abort_handle = join_set.spawn(async move {
                let outcome = lookup(source.as_ref(), &task_date, permits, &scope).await;
                (task_date, outcome)
            });
            task_dates.insert(abort_handle.id(), date.clone());
        }

        let mut outcomes = Vec::with_capacity(dates.len());

        while let Some(joined) = join_set.join_next_with_id().await {
            let (date, outcome) = match joined {
                Ok((id, result)) => {
                    task_dates.remove(&id);
                    result
                }
                Err(e) => {
                    tracing::error!(error = %e, "Lookup task failed");
                    let date = task_dates.remove(&e.id()).unwrap_or_default();
                    (date, LookupOutcome::Failure(LookupError::TaskFailed(e.to_string())))
                }
            };

            if let LookupOutcome::Failure(e) = &outcome {
                tracing::warn!(date = %date, error = %e, "Lookup failed, date contributes nothing");
            }
            counter!(LOOKUPS, "outcome" => outcome.metric_tag()).increment(1);
            outcomes.push((date, outcome));
        }

        outcomes
    }
}

async fn lookup(
    source: &dyn CountSource,
    date: &str,
    permits: Option<Arc<Semaphore>>,
    scope: &CancellationToken,
) -> LookupOutcome {
    let work = async {
        let _permit = match permits {
            Some(permits) => match permits.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => return Err(LookupError::TaskFailed(e.to_string())),
            },
            None => None,
        };
        tracing::debug!(date, "Looking up element count");
        source.element_count(date).await
    };

    tokio::select! {
        biased;
        _ = scope.cancelled() => LookupOutcome::Failure(LookupError::Cancelled),
        result = work => result.into(),
    }
}
