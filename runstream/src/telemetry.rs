//! Tracing and telemetry instrumentation for runstream.
//!
//! Span constructors and `record_*` helpers used across the run lifecycle.
//! Every helper logs through `tracing`; with the `metrics` feature enabled it
//! also updates the Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use runstream::telemetry::{run_execute_span, record_run_completed};
//!
//! let span = run_execute_span(run_id, "runstream-42-w0");
//! let _enter = span.enter();
//! // ... drive the engine
//! record_run_completed("success");
//! ```

use tracing::{info_span, Span};

use crate::run::RunId;

/// Span around validating and persisting a new run.
#[must_use]
pub fn run_create_span(kind: impl AsRef<str>, assistant_id: impl AsRef<str>) -> Span {
    info_span!(
        "runstream.create",
        run_kind = %kind.as_ref(),
        assistant_id = %assistant_id.as_ref(),
    )
}

/// Span around one engine execution on a worker.
#[must_use]
pub fn run_execute_span(run_id: RunId, worker_id: impl AsRef<str>) -> Span {
    info_span!(
        "runstream.execute",
        run_id = %run_id,
        worker_id = %worker_id.as_ref(),
    )
}

/// Span covering a client join, in `stream`, `wait` or `join` mode.
#[must_use]
pub fn join_span(run_id: RunId, mode: impl AsRef<str>) -> Span {
    info_span!(
        "runstream.join",
        run_id = %run_id,
        join_mode = %mode.as_ref(),
    )
}

#[must_use]
pub fn cancel_span(action: impl AsRef<str>, wait: bool) -> Span {
    info_span!(
        "runstream.cancel",
        action = %action.as_ref(),
        wait = wait,
    )
}

#[must_use]
pub fn batch_span(size: usize) -> Span {
    info_span!("runstream.batch", batch_size = size)
}

/// Record a persisted run (`stateful` or `stateless`).
pub fn record_run_created(kind: impl AsRef<str>) {
    tracing::debug!(run_kind = %kind.as_ref(), "run created");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_created(kind.as_ref());
}

/// Record a run reaching a terminal status.
pub fn record_run_completed(status: impl AsRef<str>) {
    tracing::info!(status = %status.as_ref(), "run completed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_completed(status.as_ref());
}

/// Record one event published into a run channel.
pub fn record_event_published(mode: impl AsRef<str>) {
    tracing::trace!(stream_mode = %mode.as_ref(), "event published");

    #[cfg(feature = "metrics")]
    crate::metrics::record_event_published(mode.as_ref());
}

pub fn record_cancel(action: impl AsRef<str>, count: usize) {
    tracing::debug!(action = %action.as_ref(), count = count, "runs cancelled");

    #[cfg(feature = "metrics")]
    crate::metrics::record_runs_cancelled(action.as_ref(), count as u64);
}

/// Track an open client join; the gauge drops when the guard is dropped.
#[must_use]
pub fn join_opened(mode: &'static str) -> JoinGauge {
    tracing::debug!(join_mode = mode, "join opened");

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_active_joins(mode, 1.0);

    JoinGauge { mode }
}

/// Guard returned by [`join_opened`].
#[derive(Debug)]
pub struct JoinGauge {
    mode: &'static str,
}

impl JoinGauge {
    pub fn mode(&self) -> &'static str {
        self.mode
    }
}

impl Drop for JoinGauge {
    fn drop(&mut self) {
        tracing::debug!(join_mode = self.mode, "join closed");

        #[cfg(feature = "metrics")]
        crate::metrics::adjust_active_joins(self.mode, -1.0);
    }
}

/// Observe the wall-clock duration of a run execution.
pub fn observe_run_duration(status: impl AsRef<str>, duration_secs: f64) {
    tracing::info!(
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "run duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_run_duration(status.as_ref(), duration_secs);
}

/// Start timing a run execution; finish with [`RunTimingHandle::finish`].
pub fn record_run_start(run_id: RunId) -> RunTimingHandle {
    RunTimingHandle {
        run_id,
        start: std::time::Instant::now(),
    }
}

/// Handle for tracking run execution duration.
#[derive(Debug)]
pub struct RunTimingHandle {
    run_id: RunId,
    start: std::time::Instant,
}

impl RunTimingHandle {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn finish(self, status: impl AsRef<str>) {
        observe_run_duration(status, self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let run_id = RunId::new();
        assert_eq!(
            run_create_span("stateful", "agent").metadata().unwrap().name(),
            "runstream.create"
        );
        assert_eq!(
            run_execute_span(run_id, "w0").metadata().unwrap().name(),
            "runstream.execute"
        );
        assert_eq!(
            join_span(run_id, "wait").metadata().unwrap().name(),
            "runstream.join"
        );
        assert_eq!(
            cancel_span("interrupt", false).metadata().unwrap().name(),
            "runstream.cancel"
        );
        assert_eq!(batch_span(3).metadata().unwrap().name(), "runstream.batch");
    }

    #[test]
    fn test_timing_handle() {
        let run_id = RunId::new();
        let handle = record_run_start(run_id);
        assert_eq!(handle.run_id(), run_id);

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        handle.finish("success");
    }

    #[test]
    fn test_join_gauge_reports_mode() {
        let gauge = join_opened("stream");
        assert_eq!(gauge.mode(), "stream");
    }
}
