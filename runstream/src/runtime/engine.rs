use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::channel::{ChannelError, EventChannel, StreamMode};
use crate::run::{Run, RunId};
use crate::store::{RunStore, StoreError};
use crate::telemetry;
use crate::usage::UsageCounters;

/// Failure reported by an execution engine.
///
/// The payload is what subscribers receive in the run's `error` event.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine failed: {0}")]
    Failed(Value),
}

impl EngineError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        EngineError::Failed(json!({
            "error": kind,
            "message": message.into(),
        }))
    }

    pub fn payload(&self) -> Value {
        match self {
            EngineError::Failed(payload) => payload.clone(),
        }
    }
}

impl From<ChannelError> for EngineError {
    fn from(err: ChannelError) -> Self {
        EngineError::new("ChannelClosed", err.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::new("StorageError", err.to_string())
    }
}

/// Publishing handle the engine uses to emit tagged events for its run.
///
/// An `error` event published here fails the run even if the engine then
/// returns `Ok`.
#[derive(Clone)]
pub struct EventSink {
    channel: Arc<EventChannel>,
    usage: Arc<UsageCounters>,
    error: Arc<Mutex<Option<Value>>>,
}

impl EventSink {
    pub fn new(channel: Arc<EventChannel>, usage: Arc<UsageCounters>) -> Self {
        Self {
            channel,
            usage,
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.channel.run_id()
    }

    /// Publish one event. `updates` events count as an executed node.
    pub fn publish(&self, mode: StreamMode, payload: Value) -> Result<u64, ChannelError> {
        let counts_node = mode == StreamMode::Updates;
        let error = (mode == StreamMode::Error).then(|| payload.clone());
        telemetry::record_event_published(mode.as_str());
        let seq = self.channel.publish(mode, payload)?;
        if counts_node {
            self.usage.record_nodes(1);
        }
        if let Some(error) = error {
            self.error.lock().get_or_insert(error);
        }
        Ok(seq)
    }

    /// Payload of the first `error` event published through this sink.
    pub fn published_error(&self) -> Option<Value> {
        self.error.lock().clone()
    }

    pub fn values(&self, payload: Value) -> Result<u64, ChannelError> {
        self.publish(StreamMode::Values, payload)
    }

    pub fn updates(&self, payload: Value) -> Result<u64, ChannelError> {
        self.publish(StreamMode::Updates, payload)
    }

    pub fn messages(&self, payload: Value) -> Result<u64, ChannelError> {
        self.publish(StreamMode::Messages, payload)
    }

    pub fn custom(&self, payload: Value) -> Result<u64, ChannelError> {
        self.publish(StreamMode::Custom, payload)
    }
}

/// Everything an engine gets to execute one run.
pub struct RunContext {
    pub run: Run,
    /// Thread state at the moment the run started.
    pub thread_values: Value,
    pub events: EventSink,
    pub cancel: CancelToken,
    store: Arc<dyn RunStore>,
}

impl RunContext {
    pub fn new(
        run: Run,
        thread_values: Value,
        events: EventSink,
        cancel: CancelToken,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            run,
            thread_values,
            events,
            cancel,
            store,
        }
    }

    /// Persist intermediate thread values.
    ///
    /// A later `rollback` cancellation restores the pre-run snapshot over
    /// anything written here; `interrupt` keeps it.
    pub async fn checkpoint(&self, values: Value) -> Result<(), EngineError> {
        if let Some(mut thread) = self.store.get_thread(self.run.thread_id).await? {
            thread.values = values;
            thread.updated_at = Utc::now();
            self.store.put_thread(thread).await?;
        }
        Ok(())
    }
}

/// The opaque worker that turns a run into a stream of events.
///
/// Dropping the returned future is how cancellation reaches the engine, so
/// engines should reach an `.await` regularly.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Returns the final thread values to persist, if any.
    async fn execute(&self, ctx: RunContext) -> Result<Option<Value>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_count_as_nodes() {
        let usage = Arc::new(UsageCounters::default());
        let sink = EventSink::new(Arc::new(EventChannel::new(RunId::new())), Arc::clone(&usage));
        sink.values(json!({})).unwrap();
        sink.updates(json!({"agent": {}})).unwrap();
        sink.updates(json!({"tools": {}})).unwrap();
        assert_eq!(usage.nodes(), 2);
    }

    #[test]
    fn published_error_is_remembered() {
        let sink = EventSink::new(
            Arc::new(EventChannel::new(RunId::new())),
            Arc::new(UsageCounters::default()),
        );
        assert_eq!(sink.published_error(), None);
        sink.publish(StreamMode::Error, json!({"error": "Boom"})).unwrap();
        assert_eq!(sink.published_error(), Some(json!({"error": "Boom"})));
    }

    #[test]
    fn engine_error_payload_names_kind() {
        let err = EngineError::new("ValueError", "bad input");
        assert_eq!(
            err.payload(),
            json!({"error": "ValueError", "message": "bad input"})
        );
    }

    #[test]
    fn publish_after_finish_is_an_engine_error() {
        let channel = Arc::new(EventChannel::new(RunId::new()));
        let sink = EventSink::new(Arc::clone(&channel), Arc::new(UsageCounters::default()));
        channel.finish();
        let err: EngineError = sink.values(json!({})).unwrap_err().into();
        assert_eq!(err.payload()["error"], "ChannelClosed");
    }
}
