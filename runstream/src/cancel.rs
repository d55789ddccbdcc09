use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Instrument};

use crate::error::RunError;
use crate::registry::RunRegistry;
use crate::run::{RunId, RunStatus, ThreadId};
use crate::runtime::ShutdownToken;
use crate::telemetry;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAction {
    /// Stop the run and keep whatever state it produced.
    #[default]
    Interrupt,
    /// Stop the run and restore the thread to its pre-run snapshot.
    Rollback,
}

impl CancelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelAction::Interrupt => "interrupt",
            CancelAction::Rollback => "rollback",
        }
    }
}

impl Display for CancelAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelAction {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interrupt" => Ok(CancelAction::Interrupt),
            "rollback" => Ok(CancelAction::Rollback),
            other => Err(RunError::InvalidArgument(format!(
                "invalid action {other:?}: must be 'interrupt' or 'rollback'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Pending,
    Running,
    All,
}

impl StatusFilter {
    /// `All` means every non-terminal run.
    pub fn matches(&self, status: RunStatus) -> bool {
        match self {
            StatusFilter::Pending => status == RunStatus::Pending,
            StatusFilter::Running => status == RunStatus::Running,
            StatusFilter::All => !status.is_terminal(),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StatusFilter::Pending),
            "running" => Ok(StatusFilter::Running),
            "all" => Ok(StatusFilter::All),
            _ => Err(RunError::InvalidArgument(
                "invalid status: must be 'pending', 'running', or 'all'".into(),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CancelSelector {
    Runs {
        thread_id: ThreadId,
        run_ids: Vec<RunId>,
    },
    Status(StatusFilter),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CancelRequest {
    pub selector: CancelSelector,
    pub action: CancelAction,
}

impl CancelRequest {
    pub fn runs(thread_id: ThreadId, run_ids: Vec<RunId>, action: CancelAction) -> Self {
        Self {
            selector: CancelSelector::Runs { thread_id, run_ids },
            action,
        }
    }

    pub fn status(filter: StatusFilter, action: CancelAction) -> Self {
        Self {
            selector: CancelSelector::Status(filter),
            action,
        }
    }

    /// Build a request from loosely specified transport fields.
    ///
    /// Exactly one of `status` or (`thread_id` and `run_ids`) must be given.
    pub fn from_parts(
        status: Option<&str>,
        thread_id: Option<ThreadId>,
        run_ids: Option<Vec<RunId>>,
        action: CancelAction,
    ) -> Result<Self, RunError> {
        match (status, thread_id, run_ids) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(RunError::InvalidArgument(
                "cannot specify both status and thread_id/run_ids".into(),
            )),
            (Some(status), None, None) => Ok(Self::status(status.parse()?, action)),
            (None, Some(thread_id), Some(run_ids)) => Ok(Self::runs(thread_id, run_ids, action)),
            _ => Err(RunError::InvalidArgument(
                "must specify either a thread_id and run_ids or a status".into(),
            )),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Vec<RunId>,
    /// Targets that were already terminal.
    pub skipped: Vec<RunId>,
}

/// Delivers cancellation to whatever is executing a run.
pub trait EngineSignal: Send + Sync {
    /// Returns `true` when a live execution received the signal.
    fn signal(&self, run_id: RunId, action: CancelAction) -> bool;
}

/// Per-execution cancellation handle.
///
/// The first requested action sticks; later requests only re-notify.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    token: ShutdownToken,
    action: Arc<Mutex<Option<CancelAction>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, action: CancelAction) {
        self.action.lock().get_or_insert(action);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn action(&self) -> Option<CancelAction> {
        *self.action.lock()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Resolves cancel targets, marks and signals them, and optionally waits for
/// every targeted run to drain.
pub struct CancellationCoordinator {
    registry: Arc<RunRegistry>,
    wait_timeout: Duration,
}

impl CancellationCoordinator {
    pub fn new(registry: Arc<RunRegistry>, wait_timeout: Duration) -> Self {
        Self {
            registry,
            wait_timeout,
        }
    }

    pub async fn cancel(&self, request: CancelRequest, wait: bool) -> Result<CancelOutcome, RunError> {
        let span = telemetry::cancel_span(request.action.as_str(), wait);
        async move {
            let targets = match &request.selector {
                CancelSelector::Runs { thread_id, run_ids } => {
                    let mut runs = Vec::with_capacity(run_ids.len());
                    for run_id in run_ids {
                        runs.push(self.registry.get(*run_id, *thread_id).await?);
                    }
                    runs
                }
                CancelSelector::Status(filter) => self.registry.find_by_status(*filter).await?,
            };

            let mut outcome = CancelOutcome::default();
            for run in targets {
                if run.is_terminal() {
                    outcome.skipped.push(run.run_id);
                    continue;
                }
                if self.registry.interrupt(&run, request.action).await? {
                    outcome.cancelled.push(run.run_id);
                } else {
                    outcome.skipped.push(run.run_id);
                }
            }

            telemetry::record_cancel(request.action.as_str(), outcome.cancelled.len());
            info!(
                action = %request.action,
                cancelled = outcome.cancelled.len(),
                skipped = outcome.skipped.len(),
                "Cancellation requested"
            );

            if wait && !outcome.cancelled.is_empty() {
                self.await_drained(&outcome.cancelled).await?;
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Cancel a single run under a thread.
    pub async fn cancel_run(
        &self,
        thread_id: ThreadId,
        run_id: RunId,
        action: CancelAction,
        wait: bool,
    ) -> Result<CancelOutcome, RunError> {
        self.cancel(CancelRequest::runs(thread_id, vec![run_id], action), wait)
            .await
    }

    async fn await_drained(&self, run_ids: &[RunId]) -> Result<(), RunError> {
        let drain = async {
            for run_id in run_ids {
                let subscription = self.registry.broker().subscribe(*run_id);
                self.registry.settle(&subscription).await?;
                let events = subscription.events();
                tokio::pin!(events);
                while events.next().await.is_some() {}
            }
            Ok::<(), RunError>(())
        };
        match tokio::time::timeout(self.wait_timeout, drain).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Timeout(format!(
                "cancelled runs did not finish within {:?}",
                self.wait_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_explicit_ids_are_mutually_exclusive() {
        let err = CancelRequest::from_parts(
            Some("all"),
            Some(ThreadId::new()),
            None,
            CancelAction::Interrupt,
        )
        .unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));

        let err = CancelRequest::from_parts(
            Some("running"),
            None,
            Some(vec![RunId::new()]),
            CancelAction::Interrupt,
        )
        .unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));
    }

    #[test]
    fn selector_requires_thread_and_ids_together() {
        for (thread_id, run_ids) in [
            (None, None),
            (Some(ThreadId::new()), None),
            (None, Some(vec![RunId::new()])),
        ] {
            assert!(CancelRequest::from_parts(None, thread_id, run_ids, CancelAction::Interrupt).is_err());
        }
        let thread_id = ThreadId::new();
        let run_id = RunId::new();
        let request = CancelRequest::from_parts(
            None,
            Some(thread_id),
            Some(vec![run_id]),
            CancelAction::Rollback,
        )
        .unwrap();
        assert_eq!(request, CancelRequest::runs(thread_id, vec![run_id], CancelAction::Rollback));
    }

    #[test]
    fn unknown_status_filter_is_rejected() {
        let err = CancelRequest::from_parts(Some("done"), None, None, CancelAction::Interrupt).unwrap_err();
        assert!(err.to_string().contains("'pending', 'running', or 'all'"));
    }

    #[test]
    fn all_filter_matches_only_live_runs() {
        assert!(StatusFilter::All.matches(RunStatus::Pending));
        assert!(StatusFilter::All.matches(RunStatus::Running));
        assert!(!StatusFilter::All.matches(RunStatus::Success));
        assert!(!StatusFilter::Pending.matches(RunStatus::Running));
    }

    #[test]
    fn action_parsing_is_strict() {
        assert_eq!("rollback".parse::<CancelAction>().unwrap(), CancelAction::Rollback);
        assert!("abort".parse::<CancelAction>().is_err());
    }

    #[tokio::test]
    async fn cancel_token_keeps_first_action_and_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel(CancelAction::Rollback);
        token.cancel(CancelAction::Interrupt);
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(token.action(), Some(CancelAction::Rollback));
        assert!(token.is_cancelled());
    }
}
