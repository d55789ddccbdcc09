//! Serves the runstream HTTP API over an engine that streams words back.
//!
//! ```text
//! cargo run -p runstream --example http_server --features http
//! curl -N -X POST localhost:8123/runs/stream \
//!     -H 'content-type: application/json' \
//!     -d '{"assistant_id":"words","input":{"message":"hello there"}}'
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runstream::http::{router, AppState};
use runstream::runtime::{EngineError, ExecutionEngine, RunContext, RunServiceBuilder};
use runstream::RunstreamConfig;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Emits one `messages` event per word, then the full reply as values.
struct WordEngine;

#[async_trait]
impl ExecutionEngine for WordEngine {
    async fn execute(&self, ctx: RunContext) -> Result<Option<Value>, EngineError> {
        let message = ctx
            .run
            .input
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        for word in message.split_whitespace() {
            tokio::time::sleep(Duration::from_millis(150)).await;
            ctx.events.messages(json!({ "type": "ai", "content": word }))?;
        }
        let values = json!({ "messages": [{ "type": "ai", "content": message }] });
        ctx.events.values(values.clone())?;
        Ok(Some(values))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,runstream=debug")),
        )
        .init();

    let addr = std::env::var("RUNSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:8123".into());
    let config = RunstreamConfig::default().with_workers(2);

    let service = Arc::new(
        RunServiceBuilder::new(config)
            .with_engine(Arc::new(WordEngine))
            .build()?,
    );
    service.start().await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("runstream listening on http://{}", addr);
    axum::serve(listener, router(AppState::new(Arc::clone(&service))))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    service.shutdown().await?;
    Ok(())
}
