/// Builder wiring a complete run service.
pub mod builder;
/// Engine contract and the per-run context handed to it.
pub mod engine;
/// Worker pool that executes dispatched runs.
pub mod supervisor;
/// Worker pool configuration.
pub mod worker;

pub use builder::RunServiceBuilder;
pub use engine::{EngineError, EventSink, ExecutionEngine, RunContext};
pub use supervisor::{
    ActiveRuns, DispatchQueue, RunDispatcher, RunSupervisor, ShutdownToken, SupervisorConfig,
};
pub use worker::WorkerConfig;
