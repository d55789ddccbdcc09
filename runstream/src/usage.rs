use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::runtime::ShutdownToken;

/// Process-wide run and node counters.
///
/// Request paths only ever add; [`UsageReporter`] is the single place that
/// swaps them back to zero, so no increment is lost between reports.
#[derive(Debug, Default)]
pub struct UsageCounters {
    runs: AtomicU64,
    nodes: AtomicU64,
}

impl UsageCounters {
    pub fn record_runs(&self, count: u64) {
        self.runs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_nodes(&self, count: u64) {
        self.nodes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn nodes(&self) -> u64 {
        self.nodes.load(Ordering::Relaxed)
    }

    fn take(&self) -> (u64, u64) {
        (
            self.runs.swap(0, Ordering::AcqRel),
            self.nodes.swap(0, Ordering::AcqRel),
        )
    }
}

/// Counts accumulated over one reporting window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub runs: u64,
    pub nodes: u64,
}

impl UsageReport {
    pub fn is_empty(&self) -> bool {
        self.runs == 0 && self.nodes == 0
    }
}

/// Destination for usage reports, e.g. a billing endpoint.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn submit(&self, report: &UsageReport) -> anyhow::Result<()>;
}

/// Sink that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn submit(&self, report: &UsageReport) -> anyhow::Result<()> {
        info!(
            from = %report.from,
            to = %report.to,
            runs = report.runs,
            nodes = report.nodes,
            "Usage report"
        );
        Ok(())
    }
}

/// Periodic report-and-reset loop over [`UsageCounters`].
pub struct UsageReporter {
    counters: Arc<UsageCounters>,
    sink: Arc<dyn UsageSink>,
    interval: Duration,
    window_start: Mutex<DateTime<Utc>>,
}

impl UsageReporter {
    pub fn new(counters: Arc<UsageCounters>, sink: Arc<dyn UsageSink>, interval: Duration) -> Self {
        Self {
            counters,
            sink,
            interval,
            window_start: Mutex::new(Utc::now()),
        }
    }

    /// Close the current window and submit it.
    ///
    /// Empty windows are not submitted. If the sink fails the counts are put
    /// back and the window stays open, so the next tick reports them again.
    pub async fn tick(&self) -> anyhow::Result<Option<UsageReport>> {
        let (runs, nodes) = self.counters.take();
        let to = Utc::now();
        let from = *self.window_start.lock();
        let report = UsageReport {
            from,
            to,
            runs,
            nodes,
        };
        if report.is_empty() {
            *self.window_start.lock() = to;
            return Ok(None);
        }

        match self.sink.submit(&report).await {
            Ok(()) => {
                *self.window_start.lock() = to;
                Ok(Some(report))
            }
            Err(err) => {
                self.counters.record_runs(runs);
                self.counters.record_nodes(nodes);
                Err(err.context("usage report submission failed"))
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Usage reporter shutting down");
                        if let Err(err) = self.tick().await {
                            warn!("final usage report failed: {err:#}");
                        }
                        break;
                    }
                    _ = tokio::time::sleep(self.interval) => {
                        if let Err(err) = self.tick().await {
                            warn!("usage report failed: {err:#}");
                        }
                    }
                }
            }
        })
    }
}
