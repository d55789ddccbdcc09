use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn, Instrument};

use super::engine::{EngineError, EventSink, ExecutionEngine, RunContext};
use super::worker::WorkerConfig;
use crate::cancel::{CancelAction, CancelToken, EngineSignal};
use crate::channel::StreamMode;
use crate::config::RunstreamConfig;
use crate::error::RunError;
use crate::registry::RunRegistry;
use crate::run::{OnCompletion, Run, RunId, RunStatus};
use crate::telemetry;
use crate::thread::ThreadStatus;

/// Configuration for the run supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub worker: WorkerConfig,
    /// Upper bound on a single engine execution; `None` means unbounded.
    pub run_timeout: Option<Duration>,
    /// How long `shutdown` waits for each worker.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            run_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RunstreamConfig> for SupervisorConfig {
    fn from(config: &RunstreamConfig) -> Self {
        Self {
            worker: WorkerConfig::new(config.worker_group.clone()).with_parallelism(config.workers),
            run_timeout: config.run_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands newly created runs to the execution side.
#[async_trait]
pub trait RunDispatcher: Send + Sync {
    async fn dispatch(&self, run: &Run) -> Result<(), RunError>;
}

/// Unbounded in-process queue of run ids feeding the worker pool.
#[derive(Clone, Debug)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<RunId>,
}

impl DispatchQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RunDispatcher for DispatchQueue {
    async fn dispatch(&self, run: &Run) -> Result<(), RunError> {
        self.tx
            .send(run.run_id)
            .map_err(|_| RunError::Internal("run queue is closed".into()))
    }
}

/// Cancellation tokens of every run a worker currently owns.
#[derive(Debug, Default)]
pub struct ActiveRuns {
    tokens: parking_lot::Mutex<HashMap<RunId, CancelToken>>,
}

impl ActiveRuns {
    pub fn insert(&self, run_id: RunId, token: CancelToken) {
        self.tokens.lock().insert(run_id, token);
    }

    pub fn remove(&self, run_id: RunId) -> Option<CancelToken> {
        self.tokens.lock().remove(&run_id)
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.tokens.lock().contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interrupt everything still executing.
    pub fn cancel_all(&self, action: CancelAction) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel(action);
        }
        tokens.len()
    }
}

impl EngineSignal for ActiveRuns {
    fn signal(&self, run_id: RunId, action: CancelAction) -> bool {
        match self.tokens.lock().get(&run_id) {
            Some(token) => {
                token.cancel(action);
                true
            }
            None => false,
        }
    }
}

enum Outcome {
    Completed(Option<Value>),
    Failed(EngineError),
    TimedOut(Duration),
    Cancelled(CancelAction),
}

impl Outcome {
    fn status(&self) -> RunStatus {
        match self {
            Outcome::Completed(_) => RunStatus::Success,
            Outcome::Failed(_) => RunStatus::Error,
            Outcome::TimedOut(_) => RunStatus::Timeout,
            Outcome::Cancelled(_) => RunStatus::Interrupted,
        }
    }
}

/// State shared by every worker in the pool.
struct WorkerShared {
    registry: Arc<RunRegistry>,
    engine: Arc<dyn ExecutionEngine>,
    active: Arc<ActiveRuns>,
    run_timeout: Option<Duration>,
}

/// Fixed pool of workers that pull dispatched runs and drive the engine.
///
/// Workers own the run status from `pending` to its terminal value; the
/// channel is finished only after the terminal status is stored.
pub struct RunSupervisor {
    config: SupervisorConfig,
    shared: Arc<WorkerShared>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<RunId>>>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for RunSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("RunSupervisor")
            .field("config", &self.config)
            .field("worker_count", &worker_count)
            .field("active_runs", &self.shared.active.len())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl RunSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<RunRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        active: Arc<ActiveRuns>,
        queue: mpsc::UnboundedReceiver<RunId>,
    ) -> Self {
        let run_timeout = config.run_timeout;
        Self {
            config,
            shared: Arc::new(WorkerShared {
                registry,
                engine,
                active,
                run_timeout,
            }),
            queue: Arc::new(Mutex::new(queue)),
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn active(&self) -> Arc<ActiveRuns> {
        Arc::clone(&self.shared.active)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn the configured number of workers.
    pub async fn start(&self) -> anyhow::Result<()> {
        let parallelism = self.config.worker.parallelism;
        if parallelism == 0 {
            anyhow::bail!("worker parallelism must be at least 1");
        }
        self.spawn_worker_pool(parallelism).await;
        info!(workers = parallelism, "Run supervisor started");
        Ok(())
    }

    /// Gracefully shut down the supervisor and all workers.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Initiating graceful shutdown of run supervisor");

        self.shutdown_token.cancel();
        let interrupted = self.shared.active.cancel_all(CancelAction::Interrupt);
        if interrupted > 0 {
            info!(interrupted, "Interrupted in-flight runs for shutdown");
        }

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => warn!("Worker task timed out during shutdown"),
            }
        }

        info!("Run supervisor shutdown complete");
        Ok(())
    }

    async fn spawn_worker_pool(&self, parallelism: usize) {
        let worker_group = format!("{}-{}", self.config.worker.worker_group, std::process::id());

        for i in 0..parallelism {
            let worker_id = format!("{}-w{}", worker_group, i);
            let shared = Arc::clone(&self.shared);
            let queue = Arc::clone(&self.queue);
            let shutdown = self.shutdown_token.clone();

            let handle = tokio::spawn(async move {
                Self::worker_loop(worker_id, shared, queue, shutdown).await;
            });

            let mut handles = self.worker_handles.lock().await;
            handles.push(handle);
        }
    }

    async fn worker_loop(
        worker_id: String,
        shared: Arc<WorkerShared>,
        queue: Arc<Mutex<mpsc::UnboundedReceiver<RunId>>>,
        shutdown: ShutdownToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                run_id = async { queue.lock().await.recv().await } => run_id,
            };
            let Some(run_id) = next else {
                info!("Worker {} shutting down", worker_id);
                break;
            };
            let span = telemetry::run_execute_span(run_id, &worker_id);
            Self::execute(&shared, run_id).instrument(span).await;
        }
    }

    async fn execute(shared: &WorkerShared, run_id: RunId) {
        let registry = &shared.registry;
        let run = match registry.find(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                debug!(run_id = %run_id, "Run disappeared before pickup");
                return;
            }
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Failed to load dispatched run");
                return;
            }
        };

        if run.status != RunStatus::Pending {
            // Settled before a worker got to it, typically a pending cancel.
            Self::finalize(shared, &run).await;
            return;
        }

        // The token must be registered before the run becomes visible as
        // running so that any cancel observing `running` can reach it.
        let token = CancelToken::new();
        shared.active.insert(run_id, token.clone());
        if let Some(action) = run.cancel_requested {
            token.cancel(action);
        }

        let run = match registry
            .transition_from(run_id, RunStatus::Pending, RunStatus::Running)
            .await
        {
            Ok(Some(run)) => run,
            Ok(None) => {
                shared.active.remove(run_id);
                if let Ok(Some(run)) = registry.find(run_id).await {
                    Self::finalize(shared, &run).await;
                }
                return;
            }
            Err(err) => {
                shared.active.remove(run_id);
                error!(run_id = %run_id, error = %err, "Failed to start run");
                return;
            }
        };

        let store = registry.store();
        let snapshot = match store.get_thread(run.thread_id).await {
            Ok(Some(mut thread)) => {
                let values = thread.values.clone();
                thread.status = ThreadStatus::Busy;
                thread.touch();
                if let Err(err) = store.put_thread(thread).await {
                    warn!(run_id = %run_id, error = %err, "Failed to mark thread busy");
                }
                values
            }
            Ok(None) => json!({}),
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "Failed to read thread snapshot");
                json!({})
            }
        };

        let channel = registry.broker().open(run_id);
        let sink = EventSink::new(Arc::clone(&channel), Arc::clone(registry.usage()));
        if let Err(err) = channel.publish(
            StreamMode::Metadata,
            json!({ "run_id": run_id, "attempt": 1 }),
        ) {
            debug!(run_id = %run_id, error = %err, "Channel closed before metadata event");
        }

        let timer = telemetry::record_run_start(run_id);
        let ctx = RunContext::new(
            run.clone(),
            snapshot.clone(),
            sink.clone(),
            token.clone(),
            Arc::clone(store),
        );

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled(token.action().unwrap_or_default()),
            outcome = Self::drive(shared, ctx) => outcome,
        };
        // An error the engine streamed itself fails the run regardless of its return.
        let streamed_error = sink.published_error();
        let outcome = match (outcome, &streamed_error) {
            (Outcome::Completed(_), Some(payload)) => {
                Outcome::Failed(EngineError::Failed(payload.clone()))
            }
            (outcome, _) => outcome,
        };
        let status = outcome.status();

        match &outcome {
            Outcome::Completed(_) => {}
            Outcome::Failed(err) => {
                warn!(run_id = %run_id, error = %err, "Run failed");
                if streamed_error.is_none() && !channel.is_finished() {
                    let _ = channel.publish(StreamMode::Error, err.payload());
                }
            }
            Outcome::TimedOut(limit) => {
                warn!(run_id = %run_id, limit_ms = limit.as_millis() as u64, "Run timed out");
                let _ = channel.publish(
                    StreamMode::Error,
                    json!({
                        "error": "TimeoutError",
                        "message": format!("run exceeded {} ms", limit.as_millis()),
                    }),
                );
            }
            Outcome::Cancelled(action) => {
                info!(run_id = %run_id, action = %action, "Run cancelled");
            }
        }

        Self::settle_thread(shared, &run, &outcome, snapshot).await;

        let run = match registry.transition(run_id, status).await {
            Ok(run) => run,
            Err(err) => {
                warn!(run_id = %run_id, status = %status, error = %err, "Failed to record terminal status");
                run
            }
        };
        shared.active.remove(run_id);
        timer.finish(status.as_str());
        telemetry::record_run_completed(status.as_str());
        Self::finalize(shared, &run).await;
    }

    async fn drive(shared: &WorkerShared, ctx: RunContext) -> Outcome {
        let execution = shared.engine.execute(ctx);
        let result = match shared.run_timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => return Outcome::TimedOut(limit),
            },
            None => execution.await,
        };
        match result {
            Ok(values) => Outcome::Completed(values),
            Err(err) => Outcome::Failed(err),
        }
    }

    async fn settle_thread(shared: &WorkerShared, run: &Run, outcome: &Outcome, snapshot: Value) {
        let store = shared.registry.store();
        let mut thread = match store.get_thread(run.thread_id).await {
            Ok(Some(thread)) => thread,
            Ok(None) => return,
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "Failed to load thread after run");
                return;
            }
        };
        match outcome {
            Outcome::Completed(values) => {
                if let Some(values) = values {
                    thread.values = values.clone();
                }
                thread.status = ThreadStatus::Idle;
            }
            Outcome::Failed(_) | Outcome::TimedOut(_) => thread.status = ThreadStatus::Error,
            Outcome::Cancelled(CancelAction::Rollback) => {
                thread.values = snapshot;
                thread.status = ThreadStatus::Idle;
            }
            Outcome::Cancelled(CancelAction::Interrupt) => thread.status = ThreadStatus::Interrupted,
        }
        thread.touch();
        if let Err(err) = store.put_thread(thread).await {
            warn!(run_id = %run.run_id, error = %err, "Failed to store thread after run");
        }
    }

    /// Finish the run's channel and drop a temporary thread that is done.
    async fn finalize(shared: &WorkerShared, run: &Run) {
        shared.registry.broker().finish(run.run_id);
        if run.temporary && run.on_completion == OnCompletion::Delete {
            match shared.registry.store().delete_thread(run.thread_id).await {
                Ok(_) => debug!(run_id = %run.run_id, thread_id = %run.thread_id, "Deleted temporary thread"),
                Err(err) => warn!(run_id = %run.run_id, error = %err, "Failed to delete temporary thread"),
            }
        }
    }
}
