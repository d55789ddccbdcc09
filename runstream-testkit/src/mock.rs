use async_trait::async_trait;
use parking_lot::Mutex;
use runstream::{UsageReport, UsageSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Usage sink that keeps every report and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingUsageSink {
    reports: Arc<Mutex<Vec<UsageReport>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<UsageReport> {
        self.reports.lock().clone()
    }

    pub fn total_runs(&self) -> u64 {
        self.reports.lock().iter().map(|report| report.runs).sum()
    }

    pub fn total_nodes(&self) -> u64 {
        self.reports.lock().iter().map(|report| report.nodes).sum()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn assert_report_count_eq(&self, expected: usize) {
        let actual = self.reports.lock().len();
        assert_eq!(actual, expected, "Expected {expected} usage reports, got {actual}");
    }
}

#[async_trait]
impl UsageSink for RecordingUsageSink {
    async fn submit(&self, report: &UsageReport) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("usage sink unavailable");
        }
        self.reports.lock().push(report.clone());
        Ok(())
    }
}
