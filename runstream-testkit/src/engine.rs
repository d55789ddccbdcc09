use async_trait::async_trait;
use parking_lot::Mutex;
use runstream::runtime::{EngineError, ExecutionEngine, RunContext};
use runstream::{RunId, StreamMode, INTERRUPT_KEY};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// What a [`ScriptedEngine`] run does, read from `input.script`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Script {
    /// Number of `updates` events (graph nodes) to emit.
    #[serde(default)]
    pub steps: usize,
    #[serde(default)]
    pub step_delay_ms: u64,
    /// Thread values persisted before the first step.
    #[serde(default)]
    pub checkpoint: Option<Value>,
    /// Stop after the steps and never finish on its own.
    #[serde(default)]
    pub hang: bool,
    /// Fail after the steps with this message.
    #[serde(default)]
    pub fail: Option<String>,
    /// Pause for human input after the steps.
    #[serde(default)]
    pub interrupt: bool,
    /// Stream an `error` event with this kind after the steps, then return `Ok`.
    #[serde(default)]
    pub emit_error: Option<String>,
}

impl Script {
    fn from_input(input: &Value) -> Result<Self, EngineError> {
        match input.get("script") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(script) => serde_json::from_value(script.clone())
                .map_err(|err| EngineError::new("ScriptError", err.to_string())),
        }
    }
}

/// Engine that plays a script and answers with an echo of the input message.
///
/// A completed run publishes final values of the form
/// `{"messages": [..., {"type": "human", ...}, {"type": "ai", ...}]}`.
#[derive(Default)]
pub struct ScriptedEngine {
    started: Mutex<Vec<RunId>>,
    notify: Notify,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs the engine has begun executing, in start order.
    pub fn started(&self) -> Vec<RunId> {
        self.started.lock().clone()
    }

    /// Wait until the engine has begun executing `run_id`.
    pub async fn wait_started(&self, run_id: RunId) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.started.lock().contains(&run_id) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn execute(&self, ctx: RunContext) -> Result<Option<Value>, EngineError> {
        let run_id = ctx.run.run_id;
        self.started.lock().push(run_id);
        self.notify.notify_waiters();

        let script = Script::from_input(&ctx.run.input)?;
        tracing::debug!(run_id = %run_id, steps = script.steps, hang = script.hang, "Playing script");
        if let Some(values) = &script.checkpoint {
            ctx.checkpoint(values.clone()).await?;
        }

        for step in 0..script.steps {
            if script.step_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(script.step_delay_ms)).await;
            }
            ctx.events.updates(json!({ "step": step }))?;
        }

        if script.hang {
            std::future::pending::<()>().await;
        }
        if let Some(message) = script.fail {
            return Err(EngineError::new("ScriptedFailure", message));
        }
        if let Some(kind) = script.emit_error {
            ctx.events
                .publish(StreamMode::Error, json!({ "error": kind, "message": "streamed by engine" }))?;
            return Ok(None);
        }
        if script.interrupt {
            ctx.events
                .updates(json!({ INTERRUPT_KEY: [{ "value": "need input", "resumable": true }] }))?;
            return Ok(None);
        }

        let mut messages = ctx
            .thread_values
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let said = match ctx.run.input.get("messages").and_then(Value::as_array) {
            Some(incoming) => {
                messages.extend(incoming.iter().cloned());
                last_user_content(incoming)
            }
            None => {
                let said = ctx
                    .run
                    .input
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                messages.push(json!({ "type": "human", "content": said }));
                said
            }
        };
        let reply = json!({ "type": "ai", "content": format!("echo: {said}") });
        ctx.events.messages(reply.clone())?;
        messages.push(reply);

        let values = json!({ "messages": messages });
        ctx.events.values(values.clone())?;
        Ok(Some(values))
    }
}

/// Content of the last user-authored message, in either role or type form.
fn last_user_content(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|message| {
            let role = message.get("role").or_else(|| message.get("type"));
            matches!(role.and_then(Value::as_str), Some("user" | "human"))
        })
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
