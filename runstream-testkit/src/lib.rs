//! Test doubles and fixtures for runstream.

mod engine;
mod mock;
mod store;

pub use engine::{Script, ScriptedEngine};
pub use mock::RecordingUsageSink;
pub use store::LatencyStore;

use futures::StreamExt;
use runstream::runtime::RunServiceBuilder;
use runstream::{
    JoinFrame, RunCreate, RunEventStream, RunId, RunService, RunStatus, RunStore, RunstreamConfig,
    StreamEvent, ThreadId, WaitFrame, WaitStream,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_ASSISTANT: &str = "echo-agent";

/// Payload that makes a [`ScriptedEngine`] play `script` and echo `message`.
pub fn scripted_payload(message: &str, script: Value) -> RunCreate {
    RunCreate::new(TEST_ASSISTANT).with_input(json!({ "message": message, "script": script }))
}

/// Payload that completes immediately with an echo of `message`.
pub fn echo_payload(message: &str) -> RunCreate {
    RunCreate::new(TEST_ASSISTANT).with_input(json!({ "message": message }))
}

/// Default configuration with a short cancel wait bound.
pub fn test_config() -> RunstreamConfig {
    RunstreamConfig::default()
        .with_cancel_wait_timeout(Duration::from_secs(5))
        .with_worker_group("runstream-test")
}

/// A started service plus handles on its doubles.
pub struct TestService {
    pub service: Arc<RunService>,
    pub engine: Arc<ScriptedEngine>,
    pub usage: RecordingUsageSink,
}

impl TestService {
    pub async fn start(config: RunstreamConfig) -> anyhow::Result<Self> {
        Self::start_with(config, None).await
    }

    pub async fn start_with_store(
        config: RunstreamConfig,
        store: Arc<dyn RunStore>,
    ) -> anyhow::Result<Self> {
        Self::start_with(config, Some(store)).await
    }

    async fn start_with(
        config: RunstreamConfig,
        store: Option<Arc<dyn RunStore>>,
    ) -> anyhow::Result<Self> {
        let engine = ScriptedEngine::new();
        let usage = RecordingUsageSink::new();
        let mut builder = RunServiceBuilder::new(config)
            .with_engine(engine.clone())
            .with_usage_sink(Arc::new(usage.clone()));
        if let Some(store) = store {
            builder = builder.with_store(store);
        }
        let service = Arc::new(builder.build()?);
        service.start().await?;
        Ok(Self {
            service,
            engine,
            usage,
        })
    }

    pub async fn thread(&self) -> ThreadId {
        self.service
            .create_thread(None, Default::default())
            .await
            .expect("thread creation should succeed")
            .thread_id
    }

    /// Poll until the run reaches `status`; panics after five seconds.
    pub async fn wait_for_status(&self, thread_id: ThreadId, run_id: RunId, status: RunStatus) {
        let poll = async {
            loop {
                match self.service.get_run(thread_id, run_id).await {
                    Ok(run) if run.status == status => return,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("run {run_id} never reached {status}"));
    }

    pub async fn shutdown(&self) {
        self.service
            .shutdown()
            .await
            .expect("shutdown should succeed");
    }
}

/// Every event of a join stream, dropping keep-alives.
pub async fn collect_events(stream: RunEventStream) -> Vec<StreamEvent> {
    stream
        .filter_map(|frame| async move {
            match frame {
                JoinFrame::Event(event) => Some(event),
                JoinFrame::KeepAlive => None,
            }
        })
        .collect()
        .await
}

/// The single completion value of a wait stream.
pub async fn wait_output(stream: WaitStream) -> Option<Value> {
    let frames: Vec<WaitFrame> = stream.collect().await;
    frames.into_iter().find_map(|frame| match frame {
        WaitFrame::Complete(value) => Some(value),
        WaitFrame::KeepAlive => None,
    })
}
