//! Runstream - run lifecycle, event streaming and cancellation for agent API servers.
//!
//! A client submits a run against a stateful or stateless thread, gets its id
//! back immediately, and can then stream it, wait on it, or cancel it. The
//! crate keeps those three views consistent under client disconnects,
//! concurrent cancellation and partial batch failures.
//!
//! # Core Concepts
//!
//! - **Run**: one unit of work against a thread, moving monotonically from
//!   `pending` through `running` to a terminal status ([`Run`], [`RunStatus`]).
//!
//! - **Channel**: every run publishes tagged events into an append-only
//!   [`EventChannel`] that any number of readers replay from a cursor.
//!
//! - **Handshake**: [`StreamBroker::subscribe`] attaches to a run's channel
//!   before the run is created, so a create-and-stream client never misses
//!   the first event.
//!
//! - **Join**: [`JoinProtocol`] presents a replay as an event stream with
//!   keep-alives, as a single collapsed wait result, or as a blocking join.
//!
//! - **Cancellation**: [`CancellationCoordinator`] resolves targets, signals
//!   the engine and optionally waits for the runs to drain.
//!
//! - **Runtime**: [`RunSupervisor`](runtime::RunSupervisor) drives an opaque
//!   [`ExecutionEngine`](runtime::ExecutionEngine) on a fixed worker pool;
//!   [`RunService`] ties everything together.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//! - `http` - axum routes over [`RunService`]
//!
//! # Example
//!
//! ```ignore
//! use runstream::*;
//! use runstream::runtime::RunServiceBuilder;
//!
//! let service = RunServiceBuilder::new(RunstreamConfig::default())
//!     .with_engine(engine)
//!     .build()?;
//! service.start().await?;
//!
//! let (run, mut events) = service
//!     .stream_run(RunSubmission::stateless(RunCreate::new("agent")), JoinOptions::default())
//!     .await?;
//! while let Some(frame) = events.next().await {
//!     // relay frame
//! }
//! ```

/// Barrier-synchronised batch creation.
pub mod batch;

/// Subscribe-before-create handshake over per-run channels.
///
/// [`StreamBroker`] owns the channels; a [`Subscription`] is the RAII
/// listener registration a connection holds.
pub mod broker;

/// Cancellation requests, tokens and the coordinator that applies them.
pub mod cancel;

/// Per-run append-only event log with replay from a cursor.
pub mod channel;

/// Service configuration.
pub mod config;

/// Persisted cron records.
pub mod cron;

/// Error taxonomy shared by every operation.
pub mod error;

/// Streaming, wait and blocking join presentations.
pub mod join;

/// Run metadata against storage: create, get, delete, search, transitions.
pub mod registry;

/// Run, thread and cron identifiers, run status, and creation payloads.
pub mod run;

/// Engine contract, supervisor worker pool and service builder.
pub mod runtime;

/// The assembled [`RunService`].
pub mod service;

/// Storage contract and the in-memory reference backend.
pub mod store;

/// Tracing spans and record helpers for the run lifecycle.
pub mod telemetry;

pub mod thread;

/// Usage counters and the periodic report-and-reset loop.
pub mod usage;

#[cfg(feature = "metrics")]
/// Prometheus collectors behind the `metrics` feature.
pub mod metrics;

#[cfg(feature = "http")]
/// HTTP routes over a [`RunService`].
pub mod http;

pub use batch::*;
pub use broker::*;
pub use cancel::*;
pub use channel::*;
pub use config::*;
pub use cron::*;
pub use error::*;
pub use join::*;
pub use registry::*;
pub use run::*;
pub use service::*;
pub use store::*;
pub use thread::*;
pub use usage::*;
