use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::broker::Subscription;
use crate::cancel::{CancelAction, CancellationCoordinator};
use crate::channel::{StreamEvent, StreamMode};
use crate::error::RunError;
use crate::registry::RunRegistry;
use crate::run::{Run, RunId, ThreadId};
use crate::telemetry::{self, JoinGauge};

/// Key an `updates` payload carries when the graph paused for input.
pub const INTERRUPT_KEY: &str = "__interrupt__";
/// Key wrapping an error payload in a collapsed wait result.
pub const ERROR_KEY: &str = "__error__";

#[derive(Clone, Debug, PartialEq)]
pub enum JoinFrame {
    Event(StreamEvent),
    KeepAlive,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WaitFrame {
    KeepAlive,
    Complete(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    AwaitingFirstEvent,
    Relaying,
    Completed,
    Errored,
    CancelledByClient,
}

impl JoinState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JoinState::Completed | JoinState::Errored | JoinState::CancelledByClient
        )
    }
}

/// Observable state of one join.
#[derive(Clone, Debug)]
pub struct JoinStateCell {
    tx: Arc<watch::Sender<JoinState>>,
}

impl Default for JoinStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinStateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(JoinState::AwaitingFirstEvent);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> JoinState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JoinState> {
        self.tx.subscribe()
    }

    /// Wait until the join reaches a final state.
    pub async fn settled(&self) -> JoinState {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(JoinState::is_final).await {
            Ok(state) => *state,
            Err(_) => self.get(),
        };
        state
    }

    fn observe(&self, event: &StreamEvent) {
        let errored = event.mode.is_terminal();
        self.tx.send_if_modified(|state| match *state {
            JoinState::AwaitingFirstEvent | JoinState::Relaying if errored => {
                *state = JoinState::Errored;
                true
            }
            JoinState::AwaitingFirstEvent => {
                *state = JoinState::Relaying;
                true
            }
            _ => false,
        });
    }

    fn finish(&self, next: JoinState) {
        self.tx.send_if_modified(|state| {
            if state.is_final() {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

/// Frames of a join plus a handle on its state.
pub struct JoinStream<F> {
    run_id: RunId,
    state: JoinStateCell,
    frames: Pin<Box<dyn Stream<Item = F> + Send>>,
}

impl<F> JoinStream<F> {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> &JoinStateCell {
        &self.state
    }
}

impl<F> Stream for JoinStream<F> {
    type Item = F;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<F>> {
        self.frames.as_mut().poll_next(cx)
    }
}

pub type RunEventStream = JoinStream<JoinFrame>;
pub type WaitStream = JoinStream<WaitFrame>;

#[derive(Clone, Debug, Default)]
pub struct JoinOptions {
    /// Interrupt the run if the client goes away before it finishes.
    pub cancel_on_disconnect: bool,
    /// Resume after this sequence number.
    pub last_event_id: Option<u64>,
    /// Only relay these modes; empty relays everything.
    pub stream_modes: Vec<StreamMode>,
}

impl JoinOptions {
    pub fn with_cancel_on_disconnect(mut self, cancel: bool) -> Self {
        self.cancel_on_disconnect = cancel;
        self
    }

    pub fn with_last_event_id(mut self, seq: u64) -> Self {
        self.last_event_id = Some(seq);
        self
    }

    pub fn with_stream_modes(mut self, modes: Vec<StreamMode>) -> Self {
        self.stream_modes = modes;
        self
    }

    fn relays(&self, mode: &StreamMode) -> bool {
        self.stream_modes.is_empty()
            || matches!(mode, StreamMode::Error | StreamMode::Metadata)
            || self.stream_modes.contains(mode)
    }
}

fn carries_interrupt(payload: &Value) -> bool {
    payload
        .as_object()
        .is_some_and(|object| object.contains_key(INTERRUPT_KEY))
}

fn error_output(payload: Value) -> Value {
    let mut wrapped = Map::new();
    wrapped.insert(ERROR_KEY.to_string(), payload);
    Value::Object(wrapped)
}

/// Reduce a run's event stream to the single value a wait returns.
///
/// Keeps the last `values` payload, or an `updates` payload carrying an
/// interrupt marker. The first `error` event wins immediately.
pub async fn collapse_output<S>(events: S, state: Option<&JoinStateCell>) -> Option<Value>
where
    S: Stream<Item = StreamEvent>,
{
    futures::pin_mut!(events);
    let mut last = None;
    while let Some(event) = events.next().await {
        if let Some(state) = state {
            state.observe(&event);
        }
        match event.mode {
            StreamMode::Error => return Some(error_output(event.payload)),
            StreamMode::Values => last = Some(event.payload),
            StreamMode::Updates if carries_interrupt(&event.payload) => last = Some(event.payload),
            _ => {}
        }
    }
    last
}

/// Runs on drop of an unfinished join: records the disconnect and applies
/// the disconnect policy.
struct Teardown {
    run_id: RunId,
    thread_id: Option<ThreadId>,
    cancel_on_disconnect: bool,
    coordinator: Arc<CancellationCoordinator>,
    state: JoinStateCell,
    done: bool,
    gauge: JoinGauge,
}

impl Teardown {
    fn complete(&mut self, state: JoinState) {
        self.done = true;
        self.state.finish(state);
        debug!(run_id = %self.run_id, state = ?state, join_mode = self.gauge.mode(), "Join finished");
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.state.finish(JoinState::CancelledByClient);
        info!(
            run_id = %self.run_id,
            join_mode = self.gauge.mode(),
            cancel_on_disconnect = self.cancel_on_disconnect,
            "Client disconnected from run"
        );

        if !self.cancel_on_disconnect {
            return;
        }
        let Some(thread_id) = self.thread_id else {
            return;
        };
        let run_id = self.run_id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = %run_id, "No runtime available to cancel disconnected run");
            return;
        };
        let coordinator = Arc::clone(&self.coordinator);
        runtime.spawn(async move {
            match coordinator
                .cancel_run(thread_id, run_id, CancelAction::Interrupt, false)
                .await
            {
                Ok(outcome) => debug!(
                    run_id = %run_id,
                    cancelled = outcome.cancelled.len(),
                    "Applied cancel-on-disconnect"
                ),
                Err(err) => warn!(run_id = %run_id, error = %err, "Cancel-on-disconnect failed"),
            }
        });
    }
}

/// Streaming, long-poll and blocking presentations over a run's replay.
pub struct JoinProtocol {
    registry: Arc<RunRegistry>,
    coordinator: Arc<CancellationCoordinator>,
    keepalive: Duration,
}

impl JoinProtocol {
    pub fn new(
        registry: Arc<RunRegistry>,
        coordinator: Arc<CancellationCoordinator>,
        keepalive: Duration,
    ) -> Self {
        Self {
            registry,
            coordinator,
            keepalive,
        }
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    /// Validate the target and make sure a subscription is attached.
    ///
    /// A subscription handed in by a subscribe-then-create handshake is used
    /// as is, since a temporary run may already be gone from storage.
    async fn attach(
        &self,
        run_id: RunId,
        thread_id: Option<ThreadId>,
        subscription: Option<Subscription>,
        last_event_id: Option<u64>,
    ) -> Result<(Subscription, Option<Run>), RunError> {
        let subscription = match subscription {
            Some(subscription) => subscription,
            None => {
                match thread_id {
                    Some(thread_id) => {
                        self.registry.get(run_id, thread_id).await?;
                    }
                    None => {
                        if self.registry.find(run_id).await?.is_none() {
                            return Err(RunError::run_not_found(run_id));
                        }
                    }
                }
                self.registry.broker().subscribe(run_id)
            }
        };
        let subscription = match last_event_id {
            Some(cursor) => subscription.resume_from(cursor),
            None => subscription,
        };
        let run = self.registry.settle(&subscription).await?;
        Ok((subscription, run))
    }

    fn teardown(
        &self,
        run_id: RunId,
        thread_id: Option<ThreadId>,
        cancel_on_disconnect: bool,
        state: JoinStateCell,
        mode: &'static str,
    ) -> Teardown {
        Teardown {
            run_id,
            thread_id,
            cancel_on_disconnect,
            coordinator: Arc::clone(&self.coordinator),
            state,
            done: false,
            gauge: telemetry::join_opened(mode),
        }
    }

    /// Relay a run's events as they happen, with keep-alives while idle.
    pub async fn stream(
        &self,
        run_id: RunId,
        thread_id: Option<ThreadId>,
        subscription: Option<Subscription>,
        options: JoinOptions,
    ) -> Result<RunEventStream, RunError> {
        let (subscription, run) = self
            .attach(run_id, thread_id, subscription, options.last_event_id)
            .instrument(telemetry::join_span(run_id, "stream"))
            .await?;
        let thread_id = thread_id.or(run.map(|run| run.thread_id));
        let state = JoinStateCell::new();
        let teardown = self.teardown(
            run_id,
            thread_id,
            options.cancel_on_disconnect,
            state.clone(),
            "stream",
        );
        let keepalive = self.keepalive;

        let frames = async_stream::stream! {
            let mut teardown = teardown;
            let events = subscription.events();
            let _subscription = subscription;
            futures::pin_mut!(events);
            let mut errored = false;
            loop {
                let next = tokio::time::timeout(keepalive, events.next()).await;
                match next {
                    Err(_) => yield JoinFrame::KeepAlive,
                    Ok(None) => break,
                    Ok(Some(event)) => {
                        teardown.state.observe(&event);
                        errored |= event.mode.is_terminal();
                        if options.relays(&event.mode) {
                            yield JoinFrame::Event(event);
                        }
                    }
                }
            }
            teardown.complete(if errored { JoinState::Errored } else { JoinState::Completed });
        };

        Ok(JoinStream {
            run_id,
            state,
            frames: Box::pin(frames),
        })
    }

    /// Emit keep-alives until the run is over, then its collapsed output.
    pub async fn wait(
        &self,
        run_id: RunId,
        thread_id: Option<ThreadId>,
        subscription: Option<Subscription>,
        options: JoinOptions,
    ) -> Result<WaitStream, RunError> {
        let (subscription, run) = self
            .attach(run_id, thread_id, subscription, None)
            .instrument(telemetry::join_span(run_id, "wait"))
            .await?;
        let thread_id = thread_id.or(run.map(|run| run.thread_id));
        let state = JoinStateCell::new();
        let teardown = self.teardown(
            run_id,
            thread_id,
            options.cancel_on_disconnect,
            state.clone(),
            "wait",
        );
        let registry = Arc::clone(&self.registry);
        let period = self.keepalive;

        // The consumer lives inside the stream, so dropping the stream drops
        // the subscription before the handler returns.
        let frames = async_stream::stream! {
            let mut teardown = teardown;
            let observed = teardown.state.clone();
            let events = subscription.events();
            let _subscription = subscription;
            let collapse = collapse_output(events, Some(&observed));
            futures::pin_mut!(collapse);
            let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let output = loop {
                let next = tokio::select! {
                    output = &mut collapse => Some(output),
                    _ = keepalive.tick() => None,
                };
                match next {
                    Some(output) => break output,
                    None => yield WaitFrame::KeepAlive,
                }
            };
            drop(_subscription);

            let value = match output {
                Some(value) => value,
                None => match thread_values(&registry, thread_id).await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(run_id = %run_id, error = %err, "Wait join failed");
                        error_output(json!({"error": "InternalError", "message": err.to_string()}))
                    }
                },
            };
            let final_state = if value.get(ERROR_KEY).is_some() {
                JoinState::Errored
            } else {
                JoinState::Completed
            };
            teardown.complete(final_state);
            yield WaitFrame::Complete(value);
        };

        Ok(JoinStream {
            run_id,
            state,
            frames: Box::pin(frames),
        })
    }

    /// Block until the run is over and return its collapsed output.
    pub async fn join(&self, run_id: RunId, thread_id: ThreadId) -> Result<Value, RunError> {
        let span = telemetry::join_span(run_id, "join");
        async move {
            let (subscription, _) = self.attach(run_id, Some(thread_id), None, None).await?;
            let _gauge = telemetry::join_opened("join");
            let output = collapse_output(subscription.events(), None).await;
            drop(subscription);
            match output {
                Some(value) => Ok(value),
                None => thread_values(&self.registry, Some(thread_id)).await,
            }
        }
        .instrument(span)
        .await
    }
}

async fn thread_values(registry: &RunRegistry, thread_id: Option<ThreadId>) -> Result<Value, RunError> {
    let Some(thread_id) = thread_id else {
        return Ok(json!({}));
    };
    Ok(registry
        .store()
        .get_thread(thread_id)
        .await?
        .map(|thread| thread.values)
        .unwrap_or_else(|| json!({})))
}
