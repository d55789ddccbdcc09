use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a run service.
///
/// Every field has a default, so a partial document deserializes into a
/// usable configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunstreamConfig {
    /// Idle interval after which joins emit a keep-alive frame.
    pub keepalive_interval_ms: u64,
    /// Upper bound on a cancel request that waits for its runs to drain.
    pub cancel_wait_timeout_ms: u64,
    /// Per-run execution limit. `None` lets runs take as long as they need.
    pub run_timeout_ms: Option<u64>,
    /// Number of supervisor workers.
    pub workers: usize,
    /// Prefix for worker ids in logs and spans.
    pub worker_group: String,
    /// How long shutdown waits for each worker.
    pub shutdown_timeout_ms: u64,
    pub usage_report_interval_secs: u64,
    /// Largest page a run search may request.
    pub search_limit_max: usize,
}

impl Default for RunstreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 5_000,
            cancel_wait_timeout_ms: 30_000,
            run_timeout_ms: None,
            workers: 4,
            worker_group: "runstream".to_string(),
            shutdown_timeout_ms: 30_000,
            usage_report_interval_secs: 300,
            search_limit_max: 1_000,
        }
    }
}

impl RunstreamConfig {
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_cancel_wait_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_wait_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_usage_report_interval(mut self, interval: Duration) -> Self {
        self.usage_report_interval_secs = interval.as_secs();
        self
    }

    pub fn with_search_limit_max(mut self, max: usize) -> Self {
        self.search_limit_max = max;
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn cancel_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn usage_report_interval(&self) -> Duration {
        Duration::from_secs(self.usage_report_interval_secs)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.keepalive_interval_ms == 0 {
            anyhow::bail!("keepalive_interval_ms must be positive");
        }
        if self.usage_report_interval_secs == 0 {
            anyhow::bail!("usage_report_interval_secs must be positive");
        }
        if self.search_limit_max == 0 {
            anyhow::bail!("search_limit_max must be at least 1");
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RunstreamConfig::default();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(5));
        assert_eq!(config.cancel_wait_timeout(), Duration::from_secs(30));
        assert_eq!(config.run_timeout(), None);
        assert_eq!(config.workers, 4);
        assert_eq!(config.usage_report_interval(), Duration::from_secs(300));
        assert_eq!(config.search_limit_max, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: RunstreamConfig =
            serde_json::from_str(r#"{"workers": 2, "run_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.run_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.keepalive_interval_ms, 5_000);
    }

    #[test]
    fn builders_and_validation() {
        let config = RunstreamConfig::default()
            .with_keepalive_interval(Duration::from_millis(250))
            .with_run_timeout(Some(Duration::from_secs(2)))
            .with_workers(0);
        assert_eq!(config.keepalive_interval_ms, 250);
        assert_eq!(config.run_timeout_ms, Some(2_000));
        assert!(config.validate().is_err());
    }
}
