use crate::run::{RunId, RunStatus};
use crate::store::StoreError;

/// Errors surfaced by the run lifecycle core.
///
/// Validation failures (`InvalidArgument`, `NotFound`, `DuplicateRun`) are
/// always returned before any state is mutated. Engine failures never show up
/// here once a run exists: they are published into the run's event channel as
/// `error` events instead.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Run, thread or cron is absent, or belongs to a different thread.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed selector combination, identifier or payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A client-supplied run id already exists with a different payload.
    #[error("run {0} already exists with a different payload")]
    DuplicateRun(RunId),

    /// Attempted status change that would break monotonic run progress.
    #[error("run {run_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    /// A bounded wait elapsed before the awaited condition held.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RunError {
    pub fn run_not_found(run_id: RunId) -> Self {
        Self::NotFound(format!("run {run_id}"))
    }

    pub fn thread_not_found(thread_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("thread {thread_id}"))
    }

    /// HTTP-equivalent status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RunError::NotFound(_) => 404,
            RunError::InvalidArgument(_) => 422,
            RunError::DuplicateRun(_) | RunError::InvalidTransition { .. } => 409,
            RunError::Timeout(_) => 408,
            RunError::Storage(_) | RunError::Internal(_) => 500,
        }
    }

    /// Whether this error indicates a client mistake rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        let run_id = RunId::new();
        assert_eq!(RunError::run_not_found(run_id).status_code(), 404);
        assert_eq!(RunError::InvalidArgument("x".into()).status_code(), 422);
        assert_eq!(RunError::DuplicateRun(run_id).status_code(), 409);
        assert_eq!(RunError::Timeout("cancel".into()).status_code(), 408);
        assert_eq!(
            RunError::Storage(StoreError::Backend("down".into())).status_code(),
            500
        );
        assert!(!RunError::Internal("boom".into()).is_client_error());
    }

    #[test]
    fn not_found_messages_name_the_resource() {
        let run_id = RunId::new();
        assert_eq!(
            RunError::run_not_found(run_id).to_string(),
            format!("run {run_id} not found")
        );
        assert_eq!(
            RunError::thread_not_found("t-1").to_string(),
            "thread t-1 not found"
        );
    }
}
