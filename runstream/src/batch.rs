use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::{info, Instrument};

use crate::error::RunError;
use crate::registry::RunRegistry;
use crate::run::{Run, RunSubmission};
use crate::telemetry;

/// Per-slot results of a batch, in submission order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<Result<Run, RunError>>,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.results.iter().filter_map(|result| result.as_ref().ok())
    }

    /// `(index, error)` for every slot that failed.
    pub fn failures(&self) -> Vec<(usize, &RunError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(index, result)| result.as_ref().err().map(|err| (index, err)))
            .collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }
}

/// Fans a list of creations out concurrently.
///
/// Every slot is validated first; a barrier sized to the batch holds all of
/// them at their dispatch point until the last one arrives, then all storage
/// writes proceed together. Total latency tracks the slowest write rather
/// than the sum. A failing slot does not fail its siblings.
pub struct BatchSubmitter {
    registry: Arc<RunRegistry>,
}

impl BatchSubmitter {
    pub fn new(registry: Arc<RunRegistry>) -> Self {
        Self { registry }
    }

    pub async fn submit(&self, submissions: Vec<RunSubmission>) -> BatchOutcome {
        if submissions.is_empty() {
            return BatchOutcome::default();
        }
        let size = submissions.len();
        let barrier = Arc::new(Barrier::new(size));

        let slots = submissions.into_iter().map(|submission| {
            let barrier = Arc::clone(&barrier);
            let registry = Arc::clone(&self.registry);
            async move {
                let prepared = registry.prepare(submission).await;
                // Every slot must reach the barrier, including failed ones.
                barrier.wait().await;
                registry.commit(prepared?).await
            }
        });

        let results = futures::future::join_all(slots)
            .instrument(telemetry::batch_span(size))
            .await;
        let outcome = BatchOutcome { results };
        info!(
            batch_size = size,
            failed = outcome.failures().len(),
            "Batch submitted"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reports_failures_by_index() {
        let ok = Run::pending(
            crate::run::RunId::new(),
            crate::run::ThreadId::new(),
            &crate::run::RunCreate::new("agent"),
            true,
            None,
        );
        let outcome = BatchOutcome {
            results: vec![
                Ok(ok.clone()),
                Err(RunError::InvalidArgument("assistant_id must not be empty".into())),
                Ok(ok),
            ],
        };
        let failures = outcome.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 1);
        assert_eq!(outcome.runs().count(), 2);
        assert!(!outcome.is_complete_success());
    }
}
