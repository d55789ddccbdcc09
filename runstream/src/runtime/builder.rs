use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::batch::BatchSubmitter;
use crate::broker::StreamBroker;
use crate::cancel::CancellationCoordinator;
use crate::config::RunstreamConfig;
use crate::cron::CronRegistry;
use crate::join::JoinProtocol;
use crate::registry::RunRegistry;
use crate::service::RunService;
use crate::store::{InMemoryRunStore, RunStore};
use crate::usage::{TracingUsageSink, UsageCounters, UsageReporter, UsageSink};

use super::engine::ExecutionEngine;
use super::supervisor::{ActiveRuns, DispatchQueue, RunSupervisor, SupervisorConfig};

/// Builder for a [`RunService`] with explicit dependencies.
///
/// Only the engine is required. Storage defaults to [`InMemoryRunStore`] and
/// usage reports go to [`TracingUsageSink`] unless replaced.
///
/// # Example
///
/// ```ignore
/// use runstream::*;
///
/// let service = RunServiceBuilder::new(RunstreamConfig::default())
///     .with_engine(Arc::new(MyEngine))
///     .build()?;
/// service.start().await?;
/// ```
pub struct RunServiceBuilder {
    config: RunstreamConfig,
    store: Option<Arc<dyn RunStore>>,
    engine: Option<Arc<dyn ExecutionEngine>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
}

impl fmt::Debug for RunServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunServiceBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("engine_set", &self.engine.is_some())
            .field("usage_sink_set", &self.usage_sink.is_some())
            .finish()
    }
}

impl RunServiceBuilder {
    pub fn new(config: RunstreamConfig) -> Self {
        Self {
            config,
            store: None,
            engine: None,
            usage_sink: None,
        }
    }

    /// Set the storage backend.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the execution engine.
    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set where usage reports are submitted.
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    /// Wire every component together.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is missing or the configuration is
    /// invalid.
    pub fn build(self) -> anyhow::Result<RunService> {
        self.config.validate()?;
        #[cfg(feature = "metrics")]
        crate::metrics::init_metrics()?;

        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine dependency missing"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRunStore::new()));
        let usage_sink = self
            .usage_sink
            .unwrap_or_else(|| Arc::new(TracingUsageSink));
        let config = self.config;

        let usage = Arc::new(UsageCounters::default());
        let active = Arc::new(ActiveRuns::default());
        let (queue, dispatched) = DispatchQueue::new();
        let registry = Arc::new(
            RunRegistry::new(
                Arc::clone(&store),
                StreamBroker::new(),
                Arc::new(queue),
                active.clone(),
                Arc::clone(&usage),
            )
            .with_search_limit_max(config.search_limit_max),
        );
        let coordinator = Arc::new(CancellationCoordinator::new(
            Arc::clone(&registry),
            config.cancel_wait_timeout(),
        ));
        let join = JoinProtocol::new(
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            config.keepalive_interval(),
        );
        let supervisor = RunSupervisor::new(
            SupervisorConfig::from(&config),
            Arc::clone(&registry),
            engine,
            active,
            dispatched,
        );
        let reporter = Arc::new(UsageReporter::new(
            usage,
            usage_sink,
            config.usage_report_interval(),
        ));

        Ok(RunService {
            batch: BatchSubmitter::new(Arc::clone(&registry)),
            crons: CronRegistry::new(store),
            config,
            registry,
            coordinator,
            join,
            supervisor,
            reporter,
            reporter_handle: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{EngineError, RunContext};
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopEngine;

    #[async_trait]
    impl ExecutionEngine for NoopEngine {
        async fn execute(&self, _ctx: RunContext) -> Result<Option<Value>, EngineError> {
            Ok(None)
        }
    }

    #[test]
    fn engine_is_required() {
        let err = RunServiceBuilder::new(RunstreamConfig::default())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("engine dependency missing"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = RunServiceBuilder::new(RunstreamConfig::default().with_workers(0))
            .with_engine(Arc::new(NoopEngine))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn defaults_fill_optional_dependencies() {
        let service = RunServiceBuilder::new(RunstreamConfig::default().with_workers(2))
            .with_engine(Arc::new(NoopEngine))
            .build()
            .unwrap();
        assert_eq!(service.supervisor().config().worker.parallelism, 2);
        assert!(service.broker().is_empty());
    }
}
