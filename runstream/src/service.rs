//! The assembled run service: one handle over registry, joins, cancellation,
//! batches, crons, the supervisor and the usage reporter.
//!
//! Build one with [`crate::runtime::RunServiceBuilder`].

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batch::{BatchOutcome, BatchSubmitter};
use crate::broker::{StreamBroker, Subscription};
use crate::cancel::{CancelAction, CancelOutcome, CancelRequest, CancellationCoordinator};
use crate::config::RunstreamConfig;
use crate::cron::{CronCreate, CronRegistry};
use crate::error::RunError;
use crate::join::{JoinOptions, JoinProtocol, RunEventStream, WaitStream};
use crate::registry::RunRegistry;
use crate::run::{CronId, OnDisconnect, Run, RunId, RunStatus, RunSubmission, ThreadId};
use crate::runtime::RunSupervisor;
use crate::store::{Cron, CronQuery};
use crate::thread::Thread;
use crate::usage::{UsageCounters, UsageReporter};

pub struct RunService {
    pub(crate) config: RunstreamConfig,
    pub(crate) registry: Arc<RunRegistry>,
    pub(crate) coordinator: Arc<CancellationCoordinator>,
    pub(crate) join: JoinProtocol,
    pub(crate) batch: BatchSubmitter,
    pub(crate) crons: CronRegistry,
    pub(crate) supervisor: RunSupervisor,
    pub(crate) reporter: Arc<UsageReporter>,
    pub(crate) reporter_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService")
            .field("config", &self.config)
            .field("supervisor", &self.supervisor)
            .field("open_channels", &self.registry.broker().len())
            .finish()
    }
}

impl RunService {
    pub fn config(&self) -> &RunstreamConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<StreamBroker> {
        self.registry.broker()
    }

    pub fn usage(&self) -> &Arc<UsageCounters> {
        self.registry.usage()
    }

    pub fn usage_reporter(&self) -> &Arc<UsageReporter> {
        &self.reporter
    }

    pub fn supervisor(&self) -> &RunSupervisor {
        &self.supervisor
    }

    /// Start the worker pool and the usage reporting loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.supervisor.start().await?;
        let handle = Arc::clone(&self.reporter).spawn(self.supervisor.shutdown_token());
        if let Some(previous) = self.reporter_handle.lock().replace(handle) {
            previous.abort();
        }
        info!(workers = self.config.workers, "Run service started");
        Ok(())
    }

    /// Stop the workers, interrupting in-flight runs, then flush usage.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.supervisor.shutdown().await?;
        let handle = self.reporter_handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Usage reporter task failed: {err}"),
                Err(_) => warn!("Usage reporter timed out during shutdown"),
            }
        }
        info!("Run service stopped");
        Ok(())
    }

    pub async fn create_thread(
        &self,
        thread_id: Option<ThreadId>,
        metadata: Map<String, Value>,
    ) -> Result<Thread, RunError> {
        self.registry.create_thread(thread_id, metadata).await
    }

    pub async fn get_thread(&self, thread_id: ThreadId) -> Result<Thread, RunError> {
        self.registry.get_thread(thread_id).await
    }

    /// Create a run in the background and return it immediately.
    pub async fn create_run(&self, submission: RunSubmission) -> Result<Run, RunError> {
        self.registry.create(submission).await
    }

    /// Create a run and stream its events from the very first one.
    pub async fn stream_run(
        &self,
        submission: RunSubmission,
        options: JoinOptions,
    ) -> Result<(Run, RunEventStream), RunError> {
        let options = stream_options(&submission, options);
        let (run, subscription) = self.create_subscribed(submission).await?;
        let stream = self
            .join
            .stream(run.run_id, Some(run.thread_id), Some(subscription), options)
            .await?;
        Ok((run, stream))
    }

    /// Create a run and wait for its collapsed output.
    pub async fn wait_run(&self, submission: RunSubmission) -> Result<(Run, WaitStream), RunError> {
        let options = stream_options(&submission, JoinOptions::default());
        let (run, subscription) = self.create_subscribed(submission).await?;
        let stream = self
            .join
            .wait(run.run_id, Some(run.thread_id), Some(subscription), options)
            .await?;
        Ok((run, stream))
    }

    /// Subscribe before creating so no event published by the run is missed.
    async fn create_subscribed(&self, submission: RunSubmission) -> Result<(Run, Subscription), RunError> {
        let run_id = submission.run_id.unwrap_or_default();
        let subscription = self.broker().subscribe(run_id);
        match self.registry.create(submission.with_run_id(run_id)).await {
            Ok(run) => Ok((run, subscription)),
            Err(err) => {
                drop(subscription);
                self.broker().discard_if_unused(run_id);
                Err(err)
            }
        }
    }

    /// Attach to an existing run's event stream.
    pub async fn join_stream(
        &self,
        thread_id: ThreadId,
        run_id: RunId,
        options: JoinOptions,
    ) -> Result<RunEventStream, RunError> {
        self.join.stream(run_id, Some(thread_id), None, options).await
    }

    /// Block until an existing run is over and return its output.
    pub async fn join(&self, thread_id: ThreadId, run_id: RunId) -> Result<Value, RunError> {
        self.join.join(run_id, thread_id).await
    }

    pub async fn get_run(&self, thread_id: ThreadId, run_id: RunId) -> Result<Run, RunError> {
        self.registry.get(run_id, thread_id).await
    }

    pub async fn delete_run(&self, thread_id: ThreadId, run_id: RunId) -> Result<(), RunError> {
        self.registry.delete(run_id, thread_id).await
    }

    pub async fn search_runs(
        &self,
        thread_id: ThreadId,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, RunError> {
        self.registry.search(thread_id, status, limit, offset).await
    }

    pub async fn cancel(&self, request: CancelRequest, wait: bool) -> Result<CancelOutcome, RunError> {
        self.coordinator.cancel(request, wait).await
    }

    pub async fn cancel_run(
        &self,
        thread_id: ThreadId,
        run_id: RunId,
        action: CancelAction,
        wait: bool,
    ) -> Result<CancelOutcome, RunError> {
        self.coordinator.cancel_run(thread_id, run_id, action, wait).await
    }

    pub async fn submit_batch(&self, submissions: Vec<RunSubmission>) -> BatchOutcome {
        self.batch.submit(submissions).await
    }

    pub async fn create_cron(&self, thread_id: Option<ThreadId>, request: CronCreate) -> Result<Cron, RunError> {
        self.crons.create(thread_id, request).await
    }

    pub async fn search_crons(&self, query: &CronQuery) -> Result<Vec<Cron>, RunError> {
        self.crons.search(query).await
    }

    pub async fn count_crons(&self, query: &CronQuery) -> Result<usize, RunError> {
        self.crons.count(query).await
    }

    pub async fn delete_cron(&self, cron_id: CronId) -> Result<(), RunError> {
        self.crons.delete(cron_id).await
    }
}

/// Join options for a create-and-join call, derived from the payload.
fn stream_options(submission: &RunSubmission, options: JoinOptions) -> JoinOptions {
    let payload = &submission.payload;
    let cancel = options.cancel_on_disconnect || payload.on_disconnect == OnDisconnect::Cancel;
    let options = options.with_cancel_on_disconnect(cancel);
    if options.stream_modes.is_empty() && !payload.stream_mode.is_empty() {
        options.with_stream_modes(payload.stream_mode.clone())
    } else {
        options
    }
}
