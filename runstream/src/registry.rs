use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{StreamBroker, Subscription};
use crate::cancel::{CancelAction, EngineSignal, StatusFilter};
use crate::error::RunError;
use crate::run::{IfNotExists, Run, RunId, RunStatus, RunSubmission, ThreadId};
use crate::runtime::RunDispatcher;
use crate::store::{RunQuery, RunStore, StoreError};
use crate::telemetry;
use crate::thread::Thread;
use crate::usage::UsageCounters;

/// A validated creation that has not touched storage yet.
///
/// Splitting creation into prepare and commit lets batch submission line up
/// every slot before any write is awaited.
#[derive(Debug)]
pub enum PreparedRun {
    /// Idempotent replay of a run that already exists.
    Existing(Run),
    New {
        run: Run,
        new_thread: Option<Thread>,
        kind: &'static str,
    },
}

/// Run metadata against storage, plus dispatch to the execution side.
pub struct RunRegistry {
    store: Arc<dyn RunStore>,
    broker: Arc<StreamBroker>,
    dispatcher: Arc<dyn RunDispatcher>,
    signals: Arc<dyn EngineSignal>,
    usage: Arc<UsageCounters>,
    search_limit_max: usize,
}

impl RunRegistry {
    pub fn new(
        store: Arc<dyn RunStore>,
        broker: Arc<StreamBroker>,
        dispatcher: Arc<dyn RunDispatcher>,
        signals: Arc<dyn EngineSignal>,
        usage: Arc<UsageCounters>,
    ) -> Self {
        Self {
            store,
            broker,
            dispatcher,
            signals,
            usage,
            search_limit_max: 1000,
        }
    }

    pub fn with_search_limit_max(mut self, max: usize) -> Self {
        self.search_limit_max = max.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<StreamBroker> {
        &self.broker
    }

    pub fn usage(&self) -> &Arc<UsageCounters> {
        &self.usage
    }

    /// Validate, persist as `pending`, and dispatch a run.
    pub async fn create(&self, submission: RunSubmission) -> Result<Run, RunError> {
        let span = telemetry::run_create_span(submission.kind(), &submission.payload.assistant_id);
        async move {
            let prepared = self.prepare(submission).await?;
            self.commit(prepared).await
        }
        .instrument(span)
        .await
    }

    /// Validation and reads only; nothing is written.
    pub async fn prepare(&self, submission: RunSubmission) -> Result<PreparedRun, RunError> {
        submission.payload.validate()?;
        let kind = submission.kind();

        if let Some(run_id) = submission.run_id {
            if let Some(existing) = self.store.get_run(run_id).await? {
                return if existing.fingerprint == submission.payload.fingerprint()
                    && submission.thread_id.map_or(true, |id| id == existing.thread_id)
                {
                    debug!(run_id = %run_id, "Returning existing run for repeated create");
                    Ok(PreparedRun::Existing(existing))
                } else {
                    Err(RunError::DuplicateRun(run_id))
                };
            }
        }

        let (thread_id, new_thread, temporary) = match submission.thread_id {
            None => {
                let thread = Thread::temporary(ThreadId::new());
                (thread.thread_id, Some(thread), true)
            }
            Some(thread_id) => match self.store.get_thread(thread_id).await? {
                Some(thread) => (thread_id, None, thread.temporary),
                None => match submission.payload.if_not_exists {
                    IfNotExists::Create => (thread_id, Some(Thread::new(thread_id)), false),
                    IfNotExists::Reject => return Err(RunError::thread_not_found(thread_id)),
                },
            },
        };

        let run = Run::pending(
            submission.run_id.unwrap_or_default(),
            thread_id,
            &submission.payload,
            temporary,
            submission.request_started_at,
        );
        Ok(PreparedRun::New {
            run,
            new_thread,
            kind,
        })
    }

    /// Persist a prepared run and hand it to the execution side.
    pub async fn commit(&self, prepared: PreparedRun) -> Result<Run, RunError> {
        let (run, new_thread, kind) = match prepared {
            PreparedRun::Existing(run) => return Ok(run),
            PreparedRun::New {
                run,
                new_thread,
                kind,
            } => (run, new_thread, kind),
        };

        let created_thread = new_thread.as_ref().map(|thread| thread.thread_id);
        if let Some(thread) = new_thread {
            self.store.put_thread(thread).await?;
        }

        match self.store.insert_run(run.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                // Lost a race with an identical create.
                let existing = self.store.get_run(run.run_id).await?;
                let kept_thread = existing.as_ref().map(|existing| existing.thread_id);
                self.discard_created_thread(created_thread, kept_thread).await;
                return match existing {
                    Some(existing) if existing.fingerprint == run.fingerprint => Ok(existing),
                    _ => Err(RunError::DuplicateRun(run.run_id)),
                };
            }
            Err(err) => {
                self.discard_created_thread(created_thread, None).await;
                return Err(err.into());
            }
        }

        self.usage.record_runs(1);
        telemetry::record_run_created(kind);
        info!(
            run_id = %run.run_id,
            thread_id = %run.thread_id,
            assistant_id = %run.assistant_id,
            temporary = run.temporary,
            "Created run"
        );

        if let Err(err) = self.dispatcher.dispatch(&run).await {
            error!(run_id = %run.run_id, error = %err, "Failed to dispatch run");
            if let Err(mark_err) = self.transition(run.run_id, RunStatus::Error).await {
                warn!(run_id = %run.run_id, error = %mark_err, "Could not mark undispatched run as error");
            }
            self.broker.finish(run.run_id);
            return Err(RunError::Internal(format!("failed to dispatch run {}: {err}", run.run_id)));
        }

        Ok(run)
    }

    /// Fetch a run scoped to its thread.
    /// Remove a thread written by a commit whose run insert failed, unless
    /// the surviving run lives on it.
    async fn discard_created_thread(&self, created: Option<ThreadId>, kept: Option<ThreadId>) {
        let Some(thread_id) = created else {
            return;
        };
        if kept == Some(thread_id) {
            return;
        }
        if let Err(err) = self.store.delete_thread(thread_id).await {
            warn!(thread_id = %thread_id, error = %err, "Failed to remove thread of a failed create");
        }
    }

    pub async fn get(&self, run_id: RunId, thread_id: ThreadId) -> Result<Run, RunError> {
        match self.store.get_run(run_id).await? {
            Some(run) if run.thread_id == thread_id => Ok(run),
            _ => Err(RunError::run_not_found(run_id)),
        }
    }

    pub async fn find(&self, run_id: RunId) -> Result<Option<Run>, RunError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn find_by_status(&self, filter: StatusFilter) -> Result<Vec<Run>, RunError> {
        Ok(self.store.find_by_status(filter).await?)
    }

    pub async fn search(
        &self,
        thread_id: ThreadId,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, RunError> {
        if self.store.get_thread(thread_id).await?.is_none() {
            return Err(RunError::thread_not_found(thread_id));
        }
        let mut query = RunQuery::for_thread(thread_id)
            .with_window(limit.clamp(1, self.search_limit_max), offset);
        if let Some(status) = status {
            query = query.with_status(status);
        }
        Ok(self.store.search_runs(&query).await?)
    }

    /// Delete a run, interrupting it first if it is still live.
    pub async fn delete(&self, run_id: RunId, thread_id: ThreadId) -> Result<(), RunError> {
        let run = self.get(run_id, thread_id).await?;
        if !run.is_terminal() {
            self.interrupt(&run, CancelAction::Interrupt).await?;
        }
        if !self.store.delete_run(run_id).await? {
            return Err(RunError::run_not_found(run_id));
        }
        self.broker.finish(run_id);
        info!(run_id = %run_id, thread_id = %thread_id, "Deleted run");
        Ok(())
    }

    /// Move a run to `next`, refusing anything that is not monotonic.
    pub async fn transition(&self, run_id: RunId, next: RunStatus) -> Result<Run, RunError> {
        loop {
            let current = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| RunError::run_not_found(run_id))?;
            if !current.status.can_transition_to(next) {
                return Err(RunError::InvalidTransition {
                    run_id,
                    from: current.status,
                    to: next,
                });
            }
            if let Some(updated) = self
                .store
                .transition_run(run_id, current.status, next)
                .await?
            {
                debug!(run_id = %run_id, from = %current.status, to = %next, "Run transitioned");
                return Ok(updated);
            }
            // Status moved underneath us; re-evaluate against the new value.
        }
    }

    /// Transition only if the run is still in `expected`.
    pub async fn transition_from(
        &self,
        run_id: RunId,
        expected: RunStatus,
        next: RunStatus,
    ) -> Result<Option<Run>, RunError> {
        if !expected.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                run_id,
                from: expected,
                to: next,
            });
        }
        Ok(self.store.transition_run(run_id, expected, next).await?)
    }

    /// Mark a live run as cancel-requested and stop it.
    ///
    /// A pending run that no worker has picked up goes straight to
    /// `interrupted`; a running one is signalled and the supervisor records
    /// the terminal status once the engine has stopped. Returns `false` when
    /// the run had already finished, in which case nothing is touched.
    pub(crate) async fn interrupt(&self, run: &Run, action: CancelAction) -> Result<bool, RunError> {
        if self
            .store
            .mark_cancel_requested(run.run_id, action)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        let delivered = self.signals.signal(run.run_id, action);

        if run.status == RunStatus::Pending && !delivered {
            match self
                .transition_from(run.run_id, RunStatus::Pending, RunStatus::Interrupted)
                .await?
            {
                Some(_) => {
                    telemetry::record_run_completed(RunStatus::Interrupted.as_str());
                    self.broker.finish(run.run_id);
                }
                None => {
                    // A worker claimed it meanwhile; its token exists by now.
                    self.signals.signal(run.run_id, action);
                }
            }
        }
        Ok(true)
    }

    /// Finish the subscription's channel if its run is already over.
    ///
    /// A late subscriber may have created a fresh channel for a run whose
    /// original channel was retired; without this it would wait forever.
    pub async fn settle(&self, subscription: &Subscription) -> Result<Option<Run>, RunError> {
        let run = self.store.get_run(subscription.run_id()).await?;
        if run.as_ref().map_or(true, Run::is_terminal) {
            subscription.channel().finish();
        }
        Ok(run)
    }

    pub async fn create_thread(
        &self,
        thread_id: Option<ThreadId>,
        metadata: Map<String, Value>,
    ) -> Result<Thread, RunError> {
        let thread_id = thread_id.unwrap_or_default();
        if let Some(existing) = self.store.get_thread(thread_id).await? {
            return Ok(existing);
        }
        let thread = Thread::new(thread_id).with_metadata(metadata);
        self.store.put_thread(thread.clone()).await?;
        Ok(thread)
    }

    pub async fn get_thread(&self, thread_id: ThreadId) -> Result<Thread, RunError> {
        self.store
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| RunError::thread_not_found(thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunCreate;
    use crate::runtime::{ActiveRuns, DispatchQueue};
    use crate::store::InMemoryRunStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: RunRegistry,
        dispatched: mpsc::UnboundedReceiver<RunId>,
    }

    fn fixture() -> Fixture {
        let (queue, dispatched) = DispatchQueue::new();
        let registry = RunRegistry::new(
            Arc::new(InMemoryRunStore::new()),
            StreamBroker::new(),
            Arc::new(queue),
            Arc::new(ActiveRuns::default()),
            Arc::new(UsageCounters::default()),
        );
        Fixture {
            registry,
            dispatched,
        }
    }

    #[tokio::test]
    async fn create_persists_pending_and_dispatches() {
        let mut fx = fixture();
        let thread = fx.registry.create_thread(None, Map::new()).await.unwrap();
        let run = fx
            .registry
            .create(RunSubmission::stateful(thread.thread_id, RunCreate::new("agent")))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(fx.dispatched.try_recv().unwrap(), run.run_id);
        assert_eq!(fx.registry.usage().runs(), 1);
    }

    #[tokio::test]
    async fn failed_insert_removes_the_thread_it_created() {
        let fx = fixture();
        let run_id = RunId::new();
        let first = fx
            .registry
            .prepare(RunSubmission::stateless(RunCreate::new("agent")).with_run_id(run_id))
            .await
            .unwrap();
        let second = fx
            .registry
            .prepare(
                RunSubmission::stateless(RunCreate::new("agent").with_input(json!({"n": 2})))
                    .with_run_id(run_id),
            )
            .await
            .unwrap();
        let PreparedRun::New {
            new_thread: Some(orphan),
            ..
        } = &second
        else {
            panic!("stateless create must bring a temporary thread");
        };
        let orphan_id = orphan.thread_id;

        let kept = fx.registry.commit(first).await.unwrap();
        let err = fx.registry.commit(second).await.unwrap_err();
        assert!(matches!(err, RunError::DuplicateRun(id) if id == run_id));
        assert!(fx.registry.store().get_thread(orphan_id).await.unwrap().is_none());
        assert!(fx
            .registry
            .store()
            .get_thread(kept.thread_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn missing_thread_is_rejected_unless_create_requested() {
        let mut fx = fixture();
        let thread_id = ThreadId::new();
        let err = fx
            .registry
            .create(RunSubmission::stateful(thread_id, RunCreate::new("agent")))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
        assert!(fx.dispatched.try_recv().is_err());

        let run = fx
            .registry
            .create(RunSubmission::stateful(
                thread_id,
                RunCreate::new("agent").with_if_not_exists(IfNotExists::Create),
            ))
            .await
            .unwrap();
        assert_eq!(run.thread_id, thread_id);
        assert!(fx.registry.get_thread(thread_id).await.is_ok());
    }

    #[tokio::test]
    async fn stateless_runs_get_a_temporary_thread() {
        let fx = fixture();
        let run = fx
            .registry
            .create(RunSubmission::stateless(RunCreate::new("agent")))
            .await
            .unwrap();
        assert!(run.temporary);
        let thread = fx.registry.get_thread(run.thread_id).await.unwrap();
        assert!(thread.temporary);
    }

    #[tokio::test]
    async fn repeated_run_id_is_idempotent_or_conflicting() {
        let mut fx = fixture();
        let run_id = RunId::new();
        let payload = RunCreate::new("agent").with_input(json!({"q": 1}));
        let first = fx
            .registry
            .create(RunSubmission::stateless(payload.clone()).with_run_id(run_id))
            .await
            .unwrap();
        let again = fx
            .registry
            .create(RunSubmission::stateless(payload).with_run_id(run_id))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(fx.dispatched.try_recv().unwrap(), run_id);
        assert!(fx.dispatched.try_recv().is_err(), "replay must not dispatch");

        let err = fx
            .registry
            .create(
                RunSubmission::stateless(RunCreate::new("agent").with_input(json!({"q": 2})))
                    .with_run_id(run_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::DuplicateRun(id) if id == run_id));
    }

    #[tokio::test]
    async fn get_is_scoped_to_thread() {
        let fx = fixture();
        let run = fx
            .registry
            .create(RunSubmission::stateless(RunCreate::new("agent")))
            .await
            .unwrap();
        let err = fx.registry.get(run.run_id, ThreadId::new()).await.unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_runs_cannot_be_resurrected() {
        let fx = fixture();
        let run = fx
            .registry
            .create(RunSubmission::stateless(RunCreate::new("agent")))
            .await
            .unwrap();
        fx.registry.transition(run.run_id, RunStatus::Running).await.unwrap();
        fx.registry.transition(run.run_id, RunStatus::Success).await.unwrap();

        let err = fx
            .registry
            .transition(run.run_id, RunStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::InvalidTransition {
                from: RunStatus::Success,
                to: RunStatus::Running,
                ..
            }
        ));
        let stored = fx.registry.find(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn deleting_pending_run_interrupts_then_removes() {
        let fx = fixture();
        let thread = fx.registry.create_thread(None, Map::new()).await.unwrap();
        let run = fx
            .registry
            .create(RunSubmission::stateful(thread.thread_id, RunCreate::new("agent")))
            .await
            .unwrap();

        fx.registry.delete(run.run_id, thread.thread_id).await.unwrap();
        assert!(fx.registry.find(run.run_id).await.unwrap().is_none());

        let err = fx.registry.delete(run.run_id, thread.thread_id).await.unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));
    }

    #[tokio::test]
    async fn search_requires_existing_thread_and_clamps_limit() {
        let fx = fixture();
        let err = fx
            .registry
            .search(ThreadId::new(), None, 10, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound(_)));

        let thread = fx.registry.create_thread(None, Map::new()).await.unwrap();
        for _ in 0..3 {
            fx.registry
                .create(RunSubmission::stateful(thread.thread_id, RunCreate::new("agent")))
                .await
                .unwrap();
        }
        let runs = fx.registry.search(thread.thread_id, None, 0, 0).await.unwrap();
        assert_eq!(runs.len(), 1, "limit 0 is clamped to 1");
        let pending = fx
            .registry
            .search(thread.thread_id, Some(RunStatus::Pending), 100, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
    }
}
